//! Leader-side replication: per-peer progress tracking, AppendEntries
//! batching, snapshot shipping and commit advancement.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::quorum;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::Message;
use crate::raft_types::LogId;
use crate::raft_types::NodeAddress;
use crate::StateMachine;

/// Volatile state specific to the Raft leader.
pub(super) struct LeaderState {
    /// A mapping of peers to their replication state.
    pub(super) nodes: BTreeMap<NodeAddress, ReplicationState>,
}

impl LeaderState {
    pub(super) fn new(targets: impl IntoIterator<Item = NodeAddress>, last_log_index: u64) -> Self {
        let now = Instant::now();
        let nodes = targets
            .into_iter()
            .map(|target| {
                (
                    target,
                    ReplicationState {
                        matched: LogId::default(),
                        next_index: last_log_index + 1,
                        send_due: now,
                        inflight: false,
                    },
                )
            })
            .collect();
        Self { nodes }
    }
}

/// The replication state of a single target peer, from the leader's
/// perspective.
pub(super) struct ReplicationState {
    /// The last log known to be successfully replicated on the target.
    pub(super) matched: LogId,
    /// The index of the next log to send.
    ///
    /// Initialized to the leader's last log index + 1 and walked back on
    /// consistency-check rejections, helped along by the conflict hint.
    pub(super) next_index: u64,
    /// When the next send to this peer is due. Doubles as the heartbeat
    /// clock and as the retransmission deadline for an un-acked request.
    pub(super) send_due: Instant,
    /// Whether a request is outstanding and unanswered.
    pub(super) inflight: bool,
}

impl<M: StateMachine> RaftCore<M> {
    /// Transition to leader and commit the initial blank entry of the term.
    pub(super) fn become_leader(&mut self) {
        tracing::info!(id=%self.id, term = self.current_term, "transitioning to leader");
        self.target_state = State::Leader;
        self.next_election_timeout = None;
        self.votes_granted.clear();
        self.update_current_leader(UpdateCurrentLeader::ThisNode);

        let targets: Vec<NodeAddress> = self
            .membership
            .members
            .iter()
            .filter(|addr| *addr != &self.id)
            .cloned()
            .collect();
        self.leader_state = Some(LeaderState::new(targets, self.last_log_id.index));

        // Per §8, commit an initial entry as part of becoming the cluster
        // leader; it is what allows prior-term entries to commit.
        self.append_payload_to_log(crate::raft::EntryPayload::Blank);
        self.replication_pass(Instant::now());
    }

    /// One replication round: send each peer whatever it is due — a batch of
    /// entries, a snapshot if it is too far behind, or a heartbeat.
    pub(super) fn replication_pass(&mut self, now: Instant) {
        let targets: Vec<NodeAddress> = match &self.leader_state {
            Some(leader) => leader.nodes.keys().cloned().collect(),
            None => return,
        };
        for target in targets {
            self.replicate_to_target(&target, now);
        }
    }

    fn replicate_to_target(&mut self, target: &NodeAddress, now: Instant) {
        let (next_index, inflight, send_due) = match self
            .leader_state
            .as_ref()
            .and_then(|leader| leader.nodes.get(target))
        {
            Some(state) => (state.next_index, state.inflight, state.send_due),
            None => return,
        };

        // At most one un-acked request per peer; the due time doubles as the
        // retransmission deadline when a response got lost.
        if inflight && now < send_due {
            return;
        }

        // A peer whose next entry is already compacted away needs the
        // snapshot instead.
        if next_index <= self.journal.compacted_index() {
            let snapshot = match self.journal.snapshot() {
                Some(snapshot) => snapshot.clone(),
                None => return,
            };
            let rpc = InstallSnapshotRequest {
                term: self.current_term,
                leader_id: self.id.clone(),
                meta: snapshot.meta,
                data: snapshot.state,
            };
            tracing::debug!(id=%self.id, target=%target, "sending snapshot to lagging peer");
            self.send_to(target, Message::InstallSnapshot(rpc));
            self.mark_sent(target, now);
            return;
        }

        let last_index = self.last_log_id.index;
        let batch = if self.config.append_entries_use_batch {
            self.config.max_batch_entries
        } else {
            1
        };
        let entries = if last_index >= next_index {
            let hi = std::cmp::min(last_index, next_index + batch - 1);
            self.journal.entries_range(next_index, hi)
        } else {
            Vec::new()
        };

        // Nothing new and the heartbeat clock hasn't fired: stay quiet.
        if entries.is_empty() && now < send_due {
            return;
        }

        let prev_index = next_index - 1;
        let prev_log_id = LogId::new(self.journal.term_at(prev_index).unwrap_or(0), prev_index);
        let rpc = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_id,
            entries,
            leader_commit: self.commit_index,
        };
        self.send_to(target, Message::AppendEntries(rpc));
        self.mark_sent(target, now);
    }

    fn mark_sent(&mut self, target: &NodeAddress, now: Instant) {
        if let Some(state) = self
            .leader_state
            .as_mut()
            .and_then(|leader| leader.nodes.get_mut(target))
        {
            state.inflight = true;
            state.send_due = now + self.config.heartbeat_period;
        }
    }

    /// Process a follower's answer to an AppendEntries request.
    #[tracing::instrument(level = "trace", skip(self, res), fields(id=%self.id, target=%peer))]
    pub(super) fn handle_append_entries_response(&mut self, peer: NodeAddress, res: AppendEntriesResponse) {
        if res.term > self.current_term {
            self.revert_to_follower(res.term);
            self.update_next_election_timeout();
            return;
        }
        if !self.target_state.is_leader() || res.term < self.current_term {
            return;
        }

        let state = match self
            .leader_state
            .as_mut()
            .and_then(|leader| leader.nodes.get_mut(&peer))
        {
            Some(state) => state,
            None => return,
        };
        state.inflight = false;

        if res.success {
            if let Some(matched) = res.matched {
                // A heartbeat ack may report less than an earlier batch ack;
                // progress only moves forward.
                if matched.index > state.matched.index {
                    state.matched = matched;
                    state.next_index = matched.index + 1;
                }
            }
            self.advance_commit_index();
            return;
        }

        // Log mismatch: walk next_index back, letting the conflict hint jump
        // over whole conflicting terms, and retry on the next pass.
        let fallback = state.next_index.saturating_sub(1);
        let new_next = match res.conflict_opt {
            Some(conflict) => std::cmp::min(fallback, conflict.log_id.index + 1),
            None => fallback,
        };
        state.next_index = std::cmp::max(new_next, 1);
        state.send_due = Instant::now();
        tracing::debug!(id=%self.id, target=%peer, next_index = state.next_index, "append entries rejected; backing off");
    }

    /// Process a follower's answer to an InstallSnapshot request.
    pub(super) fn handle_install_snapshot_response(&mut self, peer: NodeAddress, res: InstallSnapshotResponse) {
        if res.term > self.current_term {
            self.revert_to_follower(res.term);
            self.update_next_election_timeout();
            return;
        }
        if !self.target_state.is_leader() || res.term < self.current_term {
            return;
        }

        if let Some(state) = self
            .leader_state
            .as_mut()
            .and_then(|leader| leader.nodes.get_mut(&peer))
        {
            state.inflight = false;
            if let Some(last) = res.last_log_id {
                if last.index > state.matched.index {
                    state.matched = last;
                    state.next_index = last.index + 1;
                }
            }
        }
        self.advance_commit_index();
    }

    /// Advance the commit index to the highest entry replicated on a
    /// majority, subject to the current-term constraint (§5.4.2): entries
    /// from prior terms commit only via a current-term entry above them.
    pub(super) fn advance_commit_index(&mut self) {
        let leader = match &self.leader_state {
            Some(leader) => leader,
            None => return,
        };
        let mut indexes: Vec<u64> = leader.nodes.values().map(|state| state.matched.index).collect();
        indexes.push(self.last_log_id.index);
        indexes.sort_unstable_by(|a, b| b.cmp(a));

        let majority = quorum::majority_of(self.membership.len());
        let candidate = indexes[majority - 1];
        if candidate > self.commit_index && self.journal.term_at(candidate) == Some(self.current_term) {
            tracing::trace!(id=%self.id, commit_index = candidate, "commit index advanced");
            self.commit_index = candidate;
        }
    }
}
