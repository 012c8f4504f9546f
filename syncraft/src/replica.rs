//! The public embedding surface: a handle to one replicated node.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use crossbeam_channel::TrySendError;

use crate::config::Config;
use crate::core::RaftCore;
use crate::core::SubmitRequest;
use crate::error::FailReason;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::raft_types::NodeAddress;
use crate::CommandNotify;
use crate::StateMachine;

/// How long each automatic tick may park in the poller.
const AUTO_TICK_MAX_WAIT: Duration = Duration::from_millis(50);

/// A replicated state machine node.
///
/// Commands submitted on any replica are applied, in the same order, on
/// every live replica of the cluster; the submitting caller is notified once
/// its command has committed and applied (or once it is known not to).
///
/// With `auto_tick` enabled (the default) an internal thread drives the
/// node. With it disabled, the embedder owns time: nothing happens between
/// explicit `tick` calls, which is the basis for deterministic testing.
pub struct Replica<M: StateMachine> {
    id: NodeAddress,
    tx_submit: Sender<SubmitRequest>,
    metrics: Arc<Mutex<RaftMetrics>>,
    driver: Driver<M>,
}

enum Driver<M: StateMachine> {
    /// The embedder drives the node by calling `tick`.
    Manual(Box<RaftCore<M>>),
    /// An internal thread drives the node.
    Auto {
        shutdown: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    },
    /// The node has been destroyed.
    Stopped,
}

impl<M: StateMachine> Replica<M> {
    /// Construct a node and join the cluster.
    ///
    /// `self_addr` is this node's identity and listening address;
    /// `peer_addrs` are the other members of the fixed cluster. If the
    /// config names a dump file and one exists, term, log and user state are
    /// restored from it before any networking starts.
    pub fn new(
        self_addr: NodeAddress,
        peer_addrs: Vec<NodeAddress>,
        config: Config,
        machine: M,
    ) -> RaftResult<Self> {
        let config = Arc::new(config);
        let (tx_submit, rx_submit) = crossbeam_channel::bounded(config.commands_queue_size);
        let metrics = Arc::new(Mutex::new(RaftMetrics::new_initial(self_addr.clone())));

        let mut core = RaftCore::new(
            self_addr.clone(),
            peer_addrs,
            config.clone(),
            machine,
            rx_submit,
            metrics.clone(),
        )?;

        let driver = if config.auto_tick {
            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("syncraft-{}", self_addr))
                .spawn(move || {
                    while !flag.load(Ordering::Acquire) {
                        core.tick(AUTO_TICK_MAX_WAIT);
                    }
                    core.shutdown();
                })?;
            Driver::Auto {
                shutdown,
                handle: Some(handle),
            }
        } else {
            Driver::Manual(Box::new(core))
        };

        Ok(Self {
            id: self_addr,
            tx_submit,
            metrics,
            driver,
        })
    }

    /// Submit a command for replication.
    ///
    /// `cmd` is an opaque payload produced by the embedder's marshaler; it
    /// is appended to the replicated log and eventually applied on every
    /// replica. The optional `notify` callback fires exactly once: with the
    /// state machine's return bytes after this command applies, or with the
    /// reason it never will. A full submission queue fails synchronously
    /// with `FailReason::QueueFull`.
    pub fn submit(&self, cmd: Vec<u8>, notify: Option<CommandNotify>) {
        let req = SubmitRequest {
            payload: cmd,
            notify,
        };
        match self.tx_submit.try_send(req) {
            Ok(()) => {}
            Err(TrySendError::Full(req)) => {
                tracing::warn!(id=%self.id, "submission queue full");
                if let Some(notify) = req.notify {
                    notify(Err(FailReason::QueueFull));
                }
            }
            Err(TrySendError::Disconnected(req)) => {
                if let Some(notify) = req.notify {
                    notify(Err(FailReason::RequestDenied));
                }
            }
        }
    }

    /// Drive one scheduler step, blocking in the poller for at most
    /// `max_wait`. A no-op when `auto_tick` is enabled or after `destroy`.
    pub fn tick(&mut self, max_wait: Duration) {
        if let Driver::Manual(core) = &mut self.driver {
            core.tick(max_wait);
        }
    }

    /// The best-known cluster leader, if any.
    pub fn leader(&self) -> Option<NodeAddress> {
        self.metrics().current_leader
    }

    /// This node's own address.
    pub fn self_addr(&self) -> &NodeAddress {
        &self.id
    }

    /// The number of entries currently held live in the journal.
    pub fn log_size(&self) -> usize {
        self.metrics().log_size
    }

    /// A snapshot of the node's observable state, refreshed every tick.
    pub fn metrics(&self) -> RaftMetrics {
        self.metrics
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Shut the node down: close its sockets, flush the dump file and
    /// release all resources.
    pub fn destroy(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        match std::mem::replace(&mut self.driver, Driver::Stopped) {
            Driver::Manual(mut core) => core.shutdown(),
            Driver::Auto {
                shutdown,
                mut handle,
            } => {
                shutdown.store(true, Ordering::Release);
                if let Some(handle) = handle.take() {
                    let _ = handle.join();
                }
            }
            Driver::Stopped => {}
        }
    }
}

impl<M: StateMachine> Drop for Replica<M> {
    fn drop(&mut self) {
        self.stop();
    }
}
