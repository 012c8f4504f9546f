//! Command submission, pending-call tracking, leader forwarding and the
//! apply loop.

use crate::core::RaftCore;
use crate::error::FailReason;
use crate::raft::EntryNormal;
use crate::raft::EntryPayload;
use crate::raft::ForwardCommandRequest;
use crate::raft::ForwardCommandResponse;
use crate::raft::Message;
use crate::raft_types::LogId;
use crate::raft_types::NodeAddress;
use crate::CommandNotify;
use crate::StateMachine;

/// A command submitted by the embedder, crossing from its thread into the
/// scheduler through the bounded queue.
pub(crate) struct SubmitRequest {
    pub(crate) payload: Vec<u8>,
    pub(crate) notify: Option<CommandNotify>,
}

/// Where a pending command's completion goes once its entry applies: back to
/// a local callback, or over the wire to the node that forwarded it.
pub(super) enum CompletionTx {
    Local(Option<CommandNotify>),
    Remote { target: NodeAddress, request_id: u64 },
}

/// A command appended on this leader and awaiting commitment.
///
/// Retained until the entry at its index applies (success) or is lost to a
/// leadership change (failure). The recorded term detects overwrites: if the
/// applied entry at this index carries a different term, someone else's
/// entry took the slot.
pub(super) struct PendingCall {
    pub(super) term: u64,
    pub(super) tx: CompletionTx,
}

impl<M: StateMachine> RaftCore<M> {
    /// Pull everything the embedder has queued since the last tick.
    pub(super) fn drain_submission_queue(&mut self) {
        while let Ok(req) = self.rx_submit.try_recv() {
            self.handle_submit(req);
        }
    }

    fn handle_submit(&mut self, req: SubmitRequest) {
        if self.target_state.is_leader() {
            self.append_client_entry(req.payload, CompletionTx::Local(req.notify));
            return;
        }

        if !self.config.forward_to_leader {
            complete_local(
                req.notify,
                Err(FailReason::NotLeader {
                    leader: self.current_leader.clone(),
                }),
            );
            return;
        }

        match self.current_leader.clone() {
            Some(leader) if leader != self.id && self.transport.is_connected(&leader) => {
                let request_id = self.next_request_id;
                self.next_request_id += 1;
                if let Some(notify) = req.notify {
                    self.forwarded.insert(request_id, notify);
                }
                tracing::debug!(id=%self.id, leader=%leader, request_id, "forwarding command to leader");
                self.send_to(
                    &leader,
                    Message::ForwardCommand(ForwardCommandRequest {
                        request_id,
                        payload: req.payload,
                    }),
                );
            }
            // No leader to forward to; the cluster is mid-election or has
            // lost quorum.
            _ => complete_local(req.notify, Err(FailReason::RequestDenied)),
        }
    }

    /// A command forwarded to us by a peer believing we are the leader.
    pub(super) fn handle_forward_command(&mut self, peer: NodeAddress, req: ForwardCommandRequest) {
        if !self.target_state.is_leader() {
            self.send_to(
                &peer,
                Message::ForwardCommandResponse(ForwardCommandResponse {
                    request_id: req.request_id,
                    outcome: Err(FailReason::NotLeader {
                        leader: self.current_leader.clone(),
                    }),
                }),
            );
            return;
        }
        self.append_client_entry(
            req.payload,
            CompletionTx::Remote {
                target: peer,
                request_id: req.request_id,
            },
        );
    }

    /// The answer to a command this node forwarded earlier.
    pub(super) fn handle_forward_response(&mut self, res: ForwardCommandResponse) {
        if let Some(notify) = self.forwarded.remove(&res.request_id) {
            notify(res.outcome);
        }
    }

    /// Append a client command at the next index and register its pending
    /// call. Replication starts on the same tick.
    fn append_client_entry(&mut self, payload: Vec<u8>, tx: CompletionTx) {
        let log_id = self.append_payload_to_log(EntryPayload::Normal(EntryNormal { data: payload }));
        self.pending.insert(log_id.index, PendingCall { term: log_id.term, tx });
    }

    /// Apply every newly committed entry to the state machine, in strict
    /// index order, firing pending calls after each apply completes.
    pub(super) fn apply_committed_entries(&mut self) {
        while self.last_applied.index < self.commit_index {
            let index = self.last_applied.index + 1;
            let entry = match self.journal.entry(index) {
                Some(entry) => entry.clone(),
                // A committed entry must be present live or inside the
                // snapshot; a hole here means the log has diverged.
                None => panic!(
                    "apply ordering violation: entry {} missing (applied {}, commit {})",
                    index, self.last_applied, self.commit_index
                ),
            };
            let result = match &entry.payload {
                EntryPayload::Blank => Vec::new(),
                EntryPayload::Normal(normal) => self.machine.apply(&normal.data),
            };
            self.last_applied = entry.log_id;
            self.client_request_post_commit(entry.log_id, result);
        }
    }

    /// Resolve the pending call bound to a freshly applied entry, if any.
    fn client_request_post_commit(&mut self, log_id: LogId, result: Vec<u8>) {
        if let Some(call) = self.pending.remove(&log_id.index) {
            let outcome = if call.term == log_id.term {
                Ok(result)
            } else {
                // The slot was taken by another leader's entry.
                Err(FailReason::LeaderChanged)
            };
            self.complete(call.tx, outcome);
        }
    }

    /// Deliver a completion to wherever the command came from.
    fn complete(&mut self, tx: CompletionTx, outcome: Result<Vec<u8>, FailReason>) {
        match tx {
            CompletionTx::Local(Some(notify)) => notify(outcome),
            CompletionTx::Local(None) => {}
            CompletionTx::Remote { target, request_id } => {
                self.send_to(
                    &target,
                    Message::ForwardCommandResponse(ForwardCommandResponse { request_id, outcome }),
                );
            }
        }
    }

    /// Fail the pending commands bound to log slots at or above
    /// `from_index`; used when a conflicting leader overwrites the tail.
    pub(super) fn fail_pending_from(&mut self, from_index: u64, reason: FailReason) {
        let stale: Vec<u64> = self.pending.range(from_index..).map(|(index, _)| *index).collect();
        for index in stale {
            if let Some(call) = self.pending.remove(&index) {
                self.complete(call.tx, Err(reason.clone()));
            }
        }
    }

    /// Fail every locally pending command; used on step-down and shutdown.
    pub(super) fn fail_all_pending(&mut self, reason: FailReason) {
        let pending = std::mem::take(&mut self.pending);
        for (_, call) in pending {
            self.complete(call.tx, Err(reason.clone()));
        }
    }

    /// Fail every outstanding forwarded command; their replies can no longer
    /// be routed once the leader moves.
    pub(super) fn fail_forwarded(&mut self, reason: FailReason) {
        let forwarded = std::mem::take(&mut self.forwarded);
        for (_, notify) in forwarded {
            notify(Err(reason.clone()));
        }
    }
}

fn complete_local(notify: Option<CommandNotify>, outcome: Result<Vec<u8>, FailReason>) {
    if let Some(notify) = notify {
        notify(outcome);
    }
}
