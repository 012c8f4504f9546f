//! The core logic of a Raft node.

mod append_entries;
mod client;
mod install_snapshot;
mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::Receiver;

use crate::config::Config;
use crate::core::client::PendingCall;
use crate::core::replication::LeaderState;
use crate::error::FailReason;
use crate::error::RaftResult;
use crate::journal::Journal;
use crate::metrics::RaftMetrics;
use crate::poller::Poller;
use crate::raft::EntryPayload;
use crate::raft::HardState;
use crate::raft::Membership;
use crate::raft::Message;
use crate::raft_types::LogId;
use crate::raft_types::NodeAddress;
use crate::transport::Transport;
use crate::CommandNotify;
use crate::StateMachine;

pub(crate) use crate::core::client::SubmitRequest;

/// The core type implementing the Raft protocol.
///
/// Everything here — sockets, journal, user state machine, volatile Raft
/// state — is owned by one logical task and advanced exclusively through
/// `tick`. The bounded submission channel is the only boundary other threads
/// touch.
pub(crate) struct RaftCore<M: StateMachine> {
    /// This node's address, which is also its identity in the cluster.
    id: NodeAddress,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's fixed membership, this node included.
    membership: Membership,
    /// The readiness multiplexer driving all socket I/O.
    poller: Poller,
    /// Per-peer message channels.
    transport: Transport,
    /// The live log suffix, snapshot record and durable dump.
    journal: Journal,
    /// The embedder's replicated state machine.
    machine: M,

    /// The target state of the system.
    target_state: State,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// Initialized to 0 on every boot and re-derived from the leader; it is
    /// unsafe to restore a commit index from local state alone.
    commit_index: u64,
    /// The log id of the highest entry applied to the state machine.
    last_applied: LogId,

    /// The current term.
    current_term: u64,
    /// The best-known current leader of the cluster.
    current_leader: Option<NodeAddress>,
    /// The node which received this node's vote in `current_term`.
    voted_for: Option<NodeAddress>,

    /// The last entry appended to the log.
    last_log_id: LogId,

    /// The deadline at which a quiet cluster triggers a new election.
    next_election_timeout: Option<Instant>,
    /// Votes collected while campaigning in `current_term`.
    votes_granted: BTreeSet<NodeAddress>,

    /// Per-peer replication bookkeeping; populated while leading.
    leader_state: Option<LeaderState>,

    /// Commands appended locally and awaiting commit, keyed by log index.
    pending: BTreeMap<u64, PendingCall>,
    /// Submissions forwarded to the leader, keyed by request id.
    forwarded: HashMap<u64, CommandNotify>,
    next_request_id: u64,

    /// The embedder-facing command submission queue.
    rx_submit: Receiver<SubmitRequest>,
    /// Snapshot of observable state, refreshed at the end of every tick.
    tx_metrics: Arc<Mutex<RaftMetrics>>,
}

impl<M: StateMachine> RaftCore<M> {
    pub(crate) fn new(
        id: NodeAddress,
        peers: Vec<NodeAddress>,
        config: Arc<Config>,
        mut machine: M,
        rx_submit: Receiver<SubmitRequest>,
        tx_metrics: Arc<Mutex<RaftMetrics>>,
    ) -> RaftResult<Self> {
        let poller = Poller::new()?;
        let transport = Transport::new(&poller, id.clone(), peers.iter().cloned(), config.clone())?;

        let (journal, hard_state) = Journal::load(config.full_dump_file.clone());

        let mut members: BTreeSet<NodeAddress> = peers.into_iter().collect();
        members.insert(id.clone());
        let membership = Membership { members };

        // Restore the user state from the latest snapshot; entries above the
        // snapshot boundary re-apply once a leader re-establishes the commit
        // index.
        let mut last_applied = LogId::default();
        if let Some(snapshot) = journal.snapshot() {
            machine.restore(&snapshot.state);
            last_applied = snapshot.meta.last_log_id;
        }
        let last_log_id = journal.last_log_id();

        tracing::info!(
            id=%id,
            term = hard_state.current_term,
            last_log=%last_log_id,
            last_applied=%last_applied,
            "raft node is initializing"
        );

        Ok(Self {
            id,
            config,
            membership,
            poller,
            transport,
            journal,
            machine,
            target_state: State::Follower,
            commit_index: 0,
            last_applied,
            current_term: hard_state.current_term,
            current_leader: None,
            voted_for: hard_state.voted_for,
            last_log_id,
            next_election_timeout: None,
            votes_granted: BTreeSet::new(),
            leader_state: None,
            pending: BTreeMap::new(),
            forwarded: HashMap::new(),
            next_request_id: 1,
            rx_submit,
            tx_metrics,
        })
    }

    /// One cooperative scheduler step.
    ///
    /// Blocks at most `max_wait` inside the poller; everything else is
    /// non-blocking. Safe to call after shutdown (it is a no-op).
    pub(crate) fn tick(&mut self, max_wait: Duration) {
        if self.target_state == State::Shutdown {
            return;
        }

        let inbound = self.transport.poll_io(&mut self.poller, max_wait);

        let now = Instant::now();
        self.transport.advance_timers(&self.poller, now);
        self.advance_election_timer(now);

        self.drain_submission_queue();

        for (peer, msg) in inbound {
            self.handle_message(peer, msg);
        }

        if self.target_state.is_leader() {
            self.replication_pass(Instant::now());
            self.advance_commit_index();
        }

        self.apply_committed_entries();
        self.trigger_log_compaction_if_needed();
        self.report_metrics();
    }

    /// Close sockets, flush the dump and fail whatever is still in flight.
    pub(crate) fn shutdown(&mut self) {
        if self.target_state == State::Shutdown {
            return;
        }
        tracing::info!(id=%self.id, "node shutting down");
        self.target_state = State::Shutdown;
        self.fail_all_pending(FailReason::RequestDenied);
        self.fail_forwarded(FailReason::RequestDenied);
        self.journal.persist(&self.hard_state());
        self.transport.shutdown(&self.poller);
        self.report_metrics();
    }

    fn handle_message(&mut self, peer: NodeAddress, msg: Message) {
        match msg {
            // Hello frames are consumed by the transport while binding.
            Message::Hello { .. } => {}
            Message::RequestVote(rpc) => {
                let res = self.handle_vote_request(rpc);
                self.send_to(&peer, Message::RequestVoteResponse(res));
            }
            Message::RequestVoteResponse(res) => self.handle_vote_response(peer, res),
            Message::AppendEntries(rpc) => {
                let res = self.handle_append_entries_request(rpc);
                self.send_to(&peer, Message::AppendEntriesResponse(res));
            }
            Message::AppendEntriesResponse(res) => self.handle_append_entries_response(peer, res),
            Message::InstallSnapshot(rpc) => {
                let res = self.handle_install_snapshot_request(rpc);
                self.send_to(&peer, Message::InstallSnapshotResponse(res));
            }
            Message::InstallSnapshotResponse(res) => self.handle_install_snapshot_response(peer, res),
            Message::ForwardCommand(req) => self.handle_forward_command(peer, req),
            Message::ForwardCommandResponse(res) => self.handle_forward_response(res),
        }
    }

    pub(super) fn send_to(&mut self, target: &NodeAddress, msg: Message) {
        self.transport.send(&self.poller, target, &msg);
    }

    /// Campaign when the election deadline elapses without a heartbeat.
    fn advance_election_timer(&mut self, now: Instant) {
        if self.target_state.is_leader() {
            return;
        }
        let deadline = self.get_next_election_timeout();
        if now >= deadline {
            self.start_election();
        }
    }

    /// Get the next election timeout, generating a new value if not set.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = self.config.new_rand_election_timeout();
                tracing::debug!(id=%self.id, "create election timeout after: {:?}", t);
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a fresh randomized value for the next election timeout.
    pub(super) fn update_next_election_timeout(&mut self) {
        let t = self.config.new_rand_election_timeout();
        self.next_election_timeout = Some(Instant::now() + t);
    }

    /// Update the value of the `current_leader` property.
    ///
    /// Submissions forwarded to a previous leader can no longer be answered
    /// once the leader moves, so their callbacks fail here.
    pub(super) fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        let new = match update {
            UpdateCurrentLeader::ThisNode => Some(self.id.clone()),
            UpdateCurrentLeader::OtherNode(target) => Some(target),
            UpdateCurrentLeader::Unknown => None,
        };
        if new != self.current_leader {
            self.current_leader = new;
            self.fail_forwarded(FailReason::LeaderChanged);
        }
    }

    /// Encapsulate the process of updating the current term, as the
    /// `voted_for` state must be updated along with it.
    pub(super) fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeAddress>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Step down after observing a higher term.
    ///
    /// Does not touch the election deadline; callers reset it where the
    /// protocol says so (a granted vote or a valid leader message).
    pub(super) fn revert_to_follower(&mut self, term: u64) {
        if self.target_state.is_leader() {
            tracing::info!(id=%self.id, term, "reverting to follower");
            self.fail_all_pending(FailReason::LeaderChanged);
        }
        self.leader_state = None;
        self.votes_granted.clear();
        self.update_current_term(term, None);
        self.target_state = State::Follower;
    }

    pub(super) fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        }
    }

    /// Transform a payload into an entry at the next index of the current
    /// term and append it to the log.
    pub(super) fn append_payload_to_log(&mut self, payload: EntryPayload) -> LogId {
        let log_id = LogId::new(self.current_term, self.last_log_id.index + 1);
        self.journal.append(vec![crate::raft::Entry { log_id, payload }]);
        self.last_log_id = log_id;
        log_id
    }

    /// Fold the applied prefix into a snapshot when the thresholds are met.
    pub(super) fn trigger_log_compaction_if_needed(&mut self) {
        if self.last_applied.index == 0 || self.last_applied.index <= self.journal.compacted_index() {
            return;
        }
        if !self.journal.wants_compaction(
            self.config.log_compaction_min_entries,
            self.config.log_compaction_min_time,
        ) {
            return;
        }

        tracing::debug!(id=%self.id, last_applied=%self.last_applied, "compacting log");
        let meta = crate::raft::SnapshotMeta {
            last_log_id: self.last_applied,
            membership: self.membership.clone(),
        };
        let state = self.machine.snapshot();
        let hard_state = self.hard_state();
        self.journal.compact(meta, state, &hard_state);
    }

    /// Report a metrics snapshot on the current state of the Raft node.
    fn report_metrics(&mut self) {
        let metrics = RaftMetrics {
            id: self.id.clone(),
            state: self.target_state,
            current_term: self.current_term,
            current_leader: self.current_leader.clone(),
            last_log_id: self.last_log_id,
            last_applied: self.last_applied,
            commit_index: self.commit_index,
            log_size: self.journal.len(),
            snapshot_last_log_id: self
                .journal
                .snapshot()
                .map(|s| s.meta.last_log_id)
                .unwrap_or_default(),
        };
        if let Ok(mut guard) = self.tx_metrics.lock() {
            *guard = metrics;
        }
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeAddress),
    ThisNode,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The node has been destroyed and releases its resources.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}
