//! An in-memory counter application for the `syncraft` replication engine.
//!
//! This crate plays the role the embedder plays in production: it owns the
//! replicated state (a single counter), the command marshaling, and the
//! method dispatch. Commands are a serde enum — each variant is a method id
//! plus its arguments — encoded with bincode, so the replication core only
//! ever sees opaque bytes.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use serde::Deserialize;
use serde::Serialize;

use syncraft::StateMachine;

/// The marshaled command set: one variant per replicated method.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum CounterRequest {
    /// Add `delta` to the counter and return the new value.
    AddValue { delta: i64 },
}

impl CounterRequest {
    /// Marshal this request into the opaque payload `syncraft` replicates.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("counter request must encode")
    }
}

/// The value returned by a replicated method invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CounterResponse(pub i64);

impl CounterResponse {
    /// Unmarshal a response from the bytes handed to a submission callback.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

/// Marshal an `AddValue` invocation; the common case in tests.
pub fn add_value(delta: i64) -> Vec<u8> {
    CounterRequest::AddValue { delta }.encode()
}

/// The replicated counter.
///
/// The value lives behind an `Arc` so tests can keep a clone of the handle
/// and read the counter while the node's scheduler owns the state machine.
#[derive(Clone, Default)]
pub struct MemApp {
    counter: Arc<Mutex<i64>>,
}

impl MemApp {
    /// Create a new instance with the counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the current counter value.
    pub fn counter(&self) -> i64 {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, i64> {
        self.counter.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StateMachine for MemApp {
    fn apply(&mut self, payload: &[u8]) -> Vec<u8> {
        // Payloads were produced by `CounterRequest::encode` on some
        // replica; anything undecodable means the log diverged, which the
        // engine treats as fatal.
        let request: CounterRequest =
            bincode::deserialize(payload).expect("undecodable counter command in replicated log");
        match request {
            CounterRequest::AddValue { delta } => {
                let mut counter = self.lock();
                *counter += delta;
                tracing::trace!(delta, value = *counter, "applied AddValue");
                bincode::serialize(&CounterResponse(*counter)).expect("counter response must encode")
            }
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&*self.lock()).expect("counter must encode")
    }

    fn restore(&mut self, bytes: &[u8]) {
        let value: i64 = bincode::deserialize(bytes).expect("undecodable counter snapshot");
        *self.lock() = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_returns_running_total() {
        let mut app = MemApp::new();
        let res = app.apply(&add_value(150));
        assert_eq!(CounterResponse::decode(&res), Some(CounterResponse(150)));
        let res = app.apply(&add_value(200));
        assert_eq!(CounterResponse::decode(&res), Some(CounterResponse(350)));
        assert_eq!(app.counter(), 350);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut app = MemApp::new();
        app.apply(&add_value(42));
        let snapshot = app.snapshot();

        let mut other = MemApp::new();
        other.restore(&snapshot);
        assert_eq!(other.counter(), 42);
    }

    #[test]
    fn test_clones_share_state() {
        let mut app = MemApp::new();
        let view = app.clone();
        app.apply(&add_value(7));
        assert_eq!(view.counter(), 7);
    }
}
