//! An embeddable replicated state machine library.
//!
//! A cluster is a fixed set of nodes identified by `host:port` addresses.
//! Each node embeds a user-provided [`StateMachine`]; commands submitted on
//! any replica travel through the Raft consensus protocol and are applied,
//! in the same order, on every live replica, tolerating the failure of any
//! minority of the cluster.
//!
//! The engine is deliberately single-threaded: one cooperative scheduler
//! per node owns the sockets, the journal and the user state, and advances
//! everything through [`Replica::tick`]. In `auto_tick` mode (the default)
//! an internal thread calls `tick` in a loop; with it disabled the embedder
//! drives time explicitly, which is what the integration tests build on.
//!
//! ```no_run
//! use syncraft::Config;
//! use syncraft::NodeAddress;
//! use syncraft::Replica;
//! use syncraft::StateMachine;
//!
//! struct Counter(i64);
//!
//! impl StateMachine for Counter {
//!     fn apply(&mut self, payload: &[u8]) -> Vec<u8> {
//!         self.0 += payload[0] as i64;
//!         self.0.to_le_bytes().to_vec()
//!     }
//!     fn snapshot(&self) -> Vec<u8> {
//!         self.0.to_le_bytes().to_vec()
//!     }
//!     fn restore(&mut self, bytes: &[u8]) {
//!         let mut buf = [0u8; 8];
//!         buf.copy_from_slice(bytes);
//!         self.0 = i64::from_le_bytes(buf);
//!     }
//! }
//!
//! let node = Replica::new(
//!     NodeAddress::new("localhost", 6001),
//!     vec![NodeAddress::new("localhost", 6002)],
//!     Config::build().validate().unwrap(),
//!     Counter(0),
//! )
//! .unwrap();
//! node.submit(vec![5], None);
//! ```

pub mod config;
mod core;
pub mod error;
mod journal;
pub mod metrics;
mod poller;
pub mod quorum;
pub mod raft;
mod raft_types;
mod replica;
mod transport;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::core::State;
pub use crate::error::ConfigError;
pub use crate::error::FailReason;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::metrics::RaftMetrics;
pub use crate::raft_types::LogId;
pub use crate::raft_types::MessageSummary;
pub use crate::raft_types::NodeAddress;
pub use crate::replica::Replica;

/// The completion callback attached to a command submission.
///
/// Invoked exactly once, from the node's scheduler thread: with the state
/// machine's return bytes once the command has applied, or with the reason
/// it never will.
pub type CommandNotify = Box<dyn FnOnce(Result<Vec<u8>, FailReason>) + Send + 'static>;

/// The replicated user state, provided by the embedder.
///
/// The core treats both commands and state as opaque bytes; marshaling is
/// the embedder's concern. `apply` must be deterministic — every replica
/// applies the same payloads in the same order and must end up in the same
/// state — and must not block the scheduler.
pub trait StateMachine: Send + 'static {
    /// Apply one committed command and return its (opaque) result, which is
    /// delivered to the submitting caller on the node that accepted the
    /// command.
    fn apply(&mut self, payload: &[u8]) -> Vec<u8>;

    /// Capture the full user state for log compaction.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the full user state from a capture.
    fn restore(&mut self, bytes: &[u8]);
}
