//! The InstallSnapshot receiver path.

use crate::core::RaftCore;
use crate::core::UpdateCurrentLeader;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft_types::MessageSummary;
use crate::StateMachine;

impl<M: StateMachine> RaftCore<M> {
    /// Invoked by the leader to replace this node's state wholesale when the
    /// log entries it would need have been compacted away (§7).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(id=%self.id, rpc=%rpc.summary()))]
    pub(super) fn handle_install_snapshot_request(&mut self, rpc: InstallSnapshotRequest) -> InstallSnapshotResponse {
        // If the message's term is stale, we do not honor the request.
        if rpc.term < self.current_term {
            return InstallSnapshotResponse {
                term: self.current_term,
                last_log_id: None,
            };
        }

        self.update_next_election_timeout();
        if rpc.term > self.current_term || !self.target_state.is_follower() {
            self.revert_to_follower(rpc.term);
        }
        self.update_current_leader(UpdateCurrentLeader::OtherNode(rpc.leader_id.clone()));

        // A snapshot at or below what we've already applied adds nothing;
        // ack it so the leader's bookkeeping moves on.
        if rpc.meta.last_log_id.index <= self.last_applied.index {
            return InstallSnapshotResponse {
                term: self.current_term,
                last_log_id: Some(rpc.meta.last_log_id),
            };
        }

        tracing::info!(
            id=%self.id,
            boundary=%rpc.meta.last_log_id,
            bytes = rpc.data.len(),
            "installing snapshot from leader"
        );

        self.machine.restore(&rpc.data);
        let hard_state = self.hard_state();
        self.journal.install_snapshot(rpc.meta.clone(), rpc.data, &hard_state);
        self.last_log_id = self.journal.last_log_id();
        self.commit_index = rpc.meta.last_log_id.index;
        self.last_applied = rpc.meta.last_log_id;

        InstallSnapshotResponse {
            term: self.current_term,
            last_log_id: Some(rpc.meta.last_log_id),
        }
    }
}
