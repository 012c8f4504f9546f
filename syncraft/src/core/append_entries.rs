//! The AppendEntries receiver path: log consistency checks, truncation and
//! commit index propagation.

use crate::core::RaftCore;
use crate::core::UpdateCurrentLeader;
use crate::error::FailReason;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft_types::LogId;
use crate::raft_types::MessageSummary;
use crate::StateMachine;

impl<M: StateMachine> RaftCore<M> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also
    /// used as heartbeat (§5.2).
    #[tracing::instrument(level = "trace", skip(self, rpc), fields(id=%self.id, rpc=%rpc.summary()))]
    pub(super) fn handle_append_entries_request(&mut self, rpc: AppendEntriesRequest) -> AppendEntriesResponse {
        // A stale leader gets our term and nothing else.
        if rpc.term < self.current_term {
            tracing::debug!(id=%self.id, rpc_term = rpc.term, "rejecting AppendEntries with stale term");
            return AppendEntriesResponse {
                term: self.current_term,
                success: false,
                matched: None,
                conflict_opt: None,
            };
        }

        // A valid leader message: adopt term, acknowledge leadership, reset
        // the election deadline.
        self.update_next_election_timeout();
        if rpc.term > self.current_term || !self.target_state.is_follower() {
            self.revert_to_follower(rpc.term);
        }
        self.update_current_leader(UpdateCurrentLeader::OtherNode(rpc.leader_id.clone()));

        // Log consistency check on the entry preceding the batch.
        let prev = rpc.prev_log_id;
        if prev.index > self.last_log_id.index {
            // We are missing entries; point the leader at our end of log.
            return self.reject_with_conflict(self.last_log_id);
        }
        if prev.index >= self.journal.first_index() {
            match self.journal.term_at(prev.index) {
                Some(term) if term == prev.term => {}
                local_term => {
                    // Conflicting term: hint at the last entry before the
                    // conflicting local term so the leader can jump back
                    // over it in one step.
                    let hint = self.last_entry_before_term(prev.index, local_term.unwrap_or(0));
                    return self.reject_with_conflict(hint);
                }
            }
        }
        // A prev at or below the snapshot boundary is part of the committed
        // prefix and matches by definition.

        // Walk the batch: skip entries already present, truncate on the
        // first conflict, append the remainder.
        let last_new_index = prev.index + rpc.entries.len() as u64;
        let compacted = self.journal.compacted_index();
        let mut to_append = Vec::with_capacity(rpc.entries.len());
        for entry in rpc.entries {
            if entry.log_id.index <= compacted {
                continue;
            }
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            match self.journal.term_at(entry.log_id.index) {
                Some(term) if term == entry.log_id.term => {}
                Some(_) => {
                    // Same index, different term: drop the conflicting
                    // suffix. Only uncommitted entries can be involved here.
                    // Any call still bound to an overwritten slot is gone
                    // for good.
                    self.fail_pending_from(entry.log_id.index, FailReason::Discarded);
                    self.journal.truncate_suffix(entry.log_id.index, self.commit_index);
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }
        if !to_append.is_empty() {
            self.journal.append(to_append);
        }
        self.last_log_id = self.journal.last_log_id();

        // Commit what the leader has committed, capped at what we now hold.
        if rpc.leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(rpc.leader_commit, last_new_index);
        }

        let matched = LogId::new(self.journal.term_at(last_new_index).unwrap_or(prev.term), last_new_index);
        AppendEntriesResponse {
            term: self.current_term,
            success: true,
            matched: Some(matched),
            conflict_opt: None,
        }
    }

    fn reject_with_conflict(&self, hint: LogId) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success: false,
            matched: None,
            conflict_opt: Some(ConflictOpt { log_id: hint }),
        }
    }

    /// Find the last entry before the run of `term` that ends at `index`,
    /// i.e. the most recent local entry which cannot be in conflict.
    fn last_entry_before_term(&self, index: u64, term: u64) -> LogId {
        let mut first = index;
        while first > self.journal.first_index() && self.journal.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        let before = first.saturating_sub(1);
        LogId::new(self.journal.term_at(before).unwrap_or(0), before)
    }
}
