//! Error types exposed by this crate.

use serde::Deserialize;
use serde::Serialize;

use crate::raft_types::NodeAddress;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors surfaced by the node itself, as opposed to per-command outcomes.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// An address string could not be parsed as `host:port`.
    #[error("invalid node address: {0}")]
    InvalidAddress(String),
    /// An I/O error while setting up the node's sockets.
    #[error("transport setup error: {0}")]
    Io(#[from] std::io::Error),
    /// The node has shut down and can no longer accept work.
    #[error("the node is shutting down")]
    ShuttingDown,
}

/// The reason a submitted command failed to complete.
///
/// A submission callback is invoked exactly once, with either the opaque
/// return bytes produced by applying the command, or one of these reasons.
/// Callers must treat anything but success as "maybe applied, maybe not" and
/// retry idempotently if needed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum FailReason {
    /// This node is not the leader and forwarding is disabled. The best-known
    /// leader, if any, is included so the caller can redirect.
    #[error("not the cluster leader (best known: {leader:?})")]
    NotLeader { leader: Option<NodeAddress> },
    /// Leadership moved before the command committed.
    #[error("the cluster leader changed before the command committed")]
    LeaderChanged,
    /// The bounded submission queue is full.
    #[error("the command submission queue is full")]
    QueueFull,
    /// The command's log entry was overwritten before it could commit.
    #[error("the command was discarded before committing")]
    Discarded,
    /// The cluster is in a transient state (e.g. no leader is known yet) and
    /// cannot take the command.
    #[error("the cluster cannot currently accept commands")]
    RequestDenied,
}

/// Errors raised while validating a `Config` under construction.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("election timeout min must be strictly less than max")]
    InvalidElectionTimeouts,
    #[error("max_batch_entries must be greater than 0")]
    InvalidBatchSize,
    #[error("commands_queue_size must be greater than 0")]
    InvalidQueueSize,
    #[error("heartbeat_period must be shorter than election_timeout_min")]
    InvalidHeartbeatPeriod,
}
