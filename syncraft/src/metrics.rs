//! Observability snapshot of a running replica.

use crate::core::State;
use crate::raft_types::LogId;
use crate::raft_types::NodeAddress;

/// A set of metrics describing the current state of a replica node.
///
/// The scheduler publishes a fresh snapshot at the end of every tick; the
/// public handle reads it to answer `leader()`, `log_size()` and friends
/// without touching the single-threaded core.
#[derive(Clone, Debug)]
pub struct RaftMetrics {
    /// The address of the node these metrics describe.
    pub id: NodeAddress,
    /// The node's current role.
    pub state: State,
    /// The node's current term.
    pub current_term: u64,
    /// The best-known cluster leader.
    pub current_leader: Option<NodeAddress>,
    /// The last log entry appended locally.
    pub last_log_id: LogId,
    /// The last log entry applied to the state machine.
    pub last_applied: LogId,
    /// The highest log index known to be committed cluster-wide.
    pub commit_index: u64,
    /// The number of entries currently held live in the journal.
    pub log_size: usize,
    /// The log position covered by the latest snapshot, if any.
    pub snapshot_last_log_id: LogId,
}

impl RaftMetrics {
    /// A pristine snapshot for a node which has not completed a tick yet.
    pub(crate) fn new_initial(id: NodeAddress) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            current_leader: None,
            last_log_id: LogId::default(),
            last_applied: LogId::default(),
            commit_index: 0,
            log_size: 0,
            snapshot_last_log_id: LogId::default(),
        }
    }
}
