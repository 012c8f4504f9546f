//! Election handling: votes requested, granted and counted.

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::quorum;
use crate::raft::Message;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::raft_types::LogId;
use crate::raft_types::MessageSummary;
use crate::raft_types::NodeAddress;
use crate::StateMachine;

impl<M: StateMachine> RaftCore<M> {
    /// Begin a new election term: become candidate, vote for self, broadcast
    /// vote requests to all peers.
    ///
    /// Also re-entered by a candidate whose election timed out without a
    /// winner, which starts the next term.
    #[tracing::instrument(level = "debug", skip(self), fields(id=%self.id))]
    pub(super) fn start_election(&mut self) {
        self.target_state = State::Candidate;
        self.leader_state = None;
        self.update_next_election_timeout();
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.update_current_leader(UpdateCurrentLeader::Unknown);
        self.votes_granted.clear();
        self.votes_granted.insert(self.id.clone());
        tracing::info!(id=%self.id, term = self.current_term, "campaigning for leadership");

        // A single-node cluster needs no peer votes.
        if self.has_vote_quorum() {
            self.become_leader();
            return;
        }

        let rpc = VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.last_log_id.index,
            last_log_term: self.last_log_id.term,
        };
        let targets: Vec<NodeAddress> = self
            .membership
            .members
            .iter()
            .filter(|addr| *addr != &self.id)
            .cloned()
            .collect();
        for target in targets {
            self.send_to(&target, Message::RequestVote(rpc.clone()));
        }
    }

    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(id=%self.id, rpc=%rpc.summary()))]
    pub(super) fn handle_vote_request(&mut self, rpc: VoteRequest) -> VoteResponse {
        if rpc.term < self.current_term {
            tracing::debug!(id=%self.id, "rejecting vote request with stale term");
            return VoteResponse {
                term: self.current_term,
                vote_granted: false,
            };
        }

        // Observing a higher term demotes, but does not reset the election
        // deadline; only a granted vote does that.
        if rpc.term > self.current_term {
            self.revert_to_follower(rpc.term);
        }

        // Grant iff we have no conflicting vote this term and the
        // candidate's log is at least as up-to-date as ours.
        let candidate_log = LogId::new(rpc.last_log_term, rpc.last_log_index);
        let log_is_current = candidate_log >= self.last_log_id;
        let can_vote = match &self.voted_for {
            None => true,
            Some(voted) => voted == &rpc.candidate_id,
        };

        if log_is_current && can_vote {
            self.voted_for = Some(rpc.candidate_id.clone());
            self.update_next_election_timeout();
            tracing::debug!(id=%self.id, candidate=%rpc.candidate_id, term = self.current_term, "vote granted");
            VoteResponse {
                term: self.current_term,
                vote_granted: true,
            }
        } else {
            tracing::debug!(
                id=%self.id,
                candidate=%rpc.candidate_id,
                log_is_current,
                voted_for=?self.voted_for,
                "vote rejected"
            );
            VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }
        }
    }

    /// Count a peer's answer to our vote request.
    #[tracing::instrument(level = "debug", skip(self, res), fields(id=%self.id))]
    pub(super) fn handle_vote_response(&mut self, peer: NodeAddress, res: VoteResponse) {
        if res.term > self.current_term {
            self.revert_to_follower(res.term);
            return;
        }
        if !self.target_state.is_candidate() || res.term < self.current_term {
            return;
        }
        if res.vote_granted {
            self.votes_granted.insert(peer);
            if self.has_vote_quorum() {
                self.become_leader();
            }
        }
    }

    fn has_vote_quorum(&self) -> bool {
        self.votes_granted.len() >= quorum::majority_of(self.membership.len())
    }
}
