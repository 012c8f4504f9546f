//! Raft data types and the wire message set.

use serde::Deserialize;
use serde::Serialize;

use crate::error::FailReason;
use crate::raft_types::LogId;
use crate::raft_types::MessageSummary;
use crate::raft_types::NodeAddress;

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,

    /// This entry's payload.
    pub payload: EntryPayload,
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl MessageSummary for &[Entry] {
    fn summary(&self) -> String {
        let mut res = Vec::with_capacity(self.len());
        for x in self.iter() {
            res.push(x.summary());
        }
        res.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A normal log entry carrying an opaque marshaled command.
    Normal(EntryNormal),
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(n) => format!("normal({}B)", n.data.len()),
        }
    }
}

/// A normal log entry.
///
/// The contents are opaque bytes produced by the embedder's command
/// marshaler; the core never inspects them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal {
    pub data: Vec<u8>,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The fixed membership of the cluster.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// All members of the Raft cluster, this node included.
    pub members: std::collections::BTreeSet<NodeAddress>,
}

impl Membership {
    /// Check if the given address is a member of this cluster.
    pub fn contains(&self, addr: &NodeAddress) -> bool {
        self.members.contains(addr)
    }

    /// The number of members in the cluster.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Metadata describing a snapshot of the user state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Log entries up to which this snapshot includes, inclusive.
    pub last_log_id: LogId,
    /// The cluster membership captured with the snapshot.
    pub membership: Membership,
}

/// A record holding the hard state of a Raft node.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The node voted for in the `current_term`.
    pub voted_for: Option<NodeAddress>,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's address. Useful in redirecting clients.
    pub leader_id: NodeAddress,

    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// Will be true if the follower contained the entry matching `prev_log_id`.
    pub success: bool,
    /// The last log id covered by an accepted request; only present on success.
    pub matched: Option<LogId>,
    /// A value used to implement the _conflicting term_ optimization outlined in §5.3.
    ///
    /// This value will only be present, and should only be considered, when
    /// `success` is `false`. It accelerates the leader's walk back to the
    /// first index both logs agree on.
    pub conflict_opt: Option<ConflictOpt>,
}

/// A struct used to implement the _conflicting term_ optimization outlined in §5.3.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConflictOpt {
    /// The most recent entry which does not conflict with the received request.
    pub log_id: LogId,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's address.
    pub candidate_id: NodeAddress,
    /// The index of the candidate's last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate's last log entry (§5.4).
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the Raft leader to bring a lagging follower up to speed
/// when the entries it needs have already been compacted away (§7).
///
/// The whole captured user state travels in one message; there is no
/// chunking. Snapshots are bounded by the compaction thresholds, which keeps
/// them modest for the workloads this crate targets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's address. Useful in redirecting clients.
    pub leader_id: NodeAddress,
    /// Metadata of the snapshot being installed.
    pub meta: SnapshotMeta,
    /// The raw bytes of the captured user state.
    pub data: Vec<u8>,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, meta={:?}, len={}",
            self.term,
            self.leader_id,
            self.meta,
            self.data.len()
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for leader to update itself.
    pub term: u64,
    /// The snapshot position now covered by the receiver's state, so the
    /// leader can advance its replication bookkeeping.
    pub last_log_id: Option<LogId>,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A client command forwarded from a non-leader node to the leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardCommandRequest {
    /// An id unique per origin node, used to route the response back to the
    /// pending submission.
    pub request_id: u64,
    /// The opaque marshaled command payload.
    pub payload: Vec<u8>,
}

/// The outcome of a forwarded command, reported by the leader after the
/// entry applied (or failed to).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardCommandResponse {
    pub request_id: u64,
    pub outcome: Result<Vec<u8>, FailReason>,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The set of messages exchanged between cluster peers.
///
/// Each message travels as one length-prefixed frame; see the transport
/// module for the framing itself. The first message on any connection must
/// be `Hello`, which binds the peer's address to the socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    Hello { node_address: NodeAddress },
    RequestVote(VoteRequest),
    RequestVoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
    ForwardCommand(ForwardCommandRequest),
    ForwardCommandResponse(ForwardCommandResponse),
}

impl MessageSummary for Message {
    fn summary(&self) -> String {
        match self {
            Message::Hello { node_address } => format!("Hello({})", node_address),
            Message::RequestVote(rpc) => format!("RequestVote({})", rpc.summary()),
            Message::RequestVoteResponse(rpc) => {
                format!("RequestVoteResponse(term={}, granted={})", rpc.term, rpc.vote_granted)
            }
            Message::AppendEntries(rpc) => format!("AppendEntries({})", rpc.summary()),
            Message::AppendEntriesResponse(rpc) => {
                format!("AppendEntriesResponse(term={}, success={})", rpc.term, rpc.success)
            }
            Message::InstallSnapshot(rpc) => format!("InstallSnapshot({})", rpc.summary()),
            Message::InstallSnapshotResponse(rpc) => {
                format!("InstallSnapshotResponse(term={})", rpc.term)
            }
            Message::ForwardCommand(req) => {
                format!("ForwardCommand(id={}, {}B)", req.request_id, req.payload.len())
            }
            Message::ForwardCommandResponse(res) => {
                format!("ForwardCommandResponse(id={})", res.request_id)
            }
        }
    }
}
