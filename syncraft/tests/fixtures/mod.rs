//! Fixtures for testing the replication engine end to end.

#![allow(dead_code)]

use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use memapp::MemApp;
use syncraft::Config;
use syncraft::ConfigBuilder;
use syncraft::NodeAddress;
use syncraft::Replica;
use tracing_subscriber::prelude::*;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    // Ignore the error when a second test in the same binary installs again.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

static NEXT_PORT: AtomicU16 = AtomicU16::new(0);

/// Allocate a fresh localhost address.
///
/// Test binaries run as parallel processes; deriving the base port from the
/// pid keeps two binaries from landing on the same range.
pub fn next_addr() -> NodeAddress {
    let slot = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    let base = 10_000 + (std::process::id() % 1400) as u16 * 37;
    NodeAddress::new("localhost", base + slot)
}

/// The baseline config for tick-driven tests: the embedder owns time.
pub fn test_config() -> ConfigBuilder {
    Config::build()
        .auto_tick(false)
        .commands_queue_size(10_000)
        .append_entries_use_batch(false)
}

/// One node under test plus a reader handle onto its counter.
pub struct TestNode {
    pub replica: Replica<MemApp>,
    pub app: MemApp,
}

impl TestNode {
    pub fn counter(&self) -> i64 {
        self.app.counter()
    }
}

/// Construct a node from its address, its peer list and a config.
pub fn new_node(addr: &NodeAddress, peers: &[NodeAddress], config: Config) -> TestNode {
    let app = MemApp::new();
    let replica =
        Replica::new(addr.clone(), peers.to_vec(), config, app.clone()).expect("node must construct");
    TestNode { replica, app }
}

/// Construct a full cluster over the given addresses.
pub fn new_cluster(addrs: &[NodeAddress], config: &Config) -> Vec<TestNode> {
    addrs
        .iter()
        .map(|addr| {
            let peers: Vec<NodeAddress> = addrs.iter().filter(|a| *a != addr).cloned().collect();
            new_node(addr, &peers, config.clone())
        })
        .collect()
}

/// Tick the nodes selected by `include` for a fixed wall-clock duration.
pub fn do_ticks(nodes: &mut [TestNode], include: &[usize], wall: Duration) {
    let deadline = Instant::now() + wall;
    while Instant::now() < deadline {
        for &i in include {
            nodes[i].replica.tick(Duration::ZERO);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Tick the selected nodes until the predicate holds or the timeout passes.
/// Returns whether the predicate was satisfied.
pub fn ticks_until(
    nodes: &mut [TestNode],
    include: &[usize],
    timeout: Duration,
    pred: impl Fn(&[TestNode]) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        for &i in include {
            nodes[i].replica.tick(Duration::ZERO);
        }
        if pred(nodes) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// The leader every selected node agrees on, if there is one.
pub fn agreed_leader(nodes: &[TestNode], include: &[usize]) -> Option<NodeAddress> {
    let first = nodes[include[0]].replica.leader()?;
    for &i in include {
        if nodes[i].replica.leader().as_ref() != Some(&first) {
            return None;
        }
    }
    Some(first)
}

/// Indices of every node in the slice.
pub fn all(nodes: &[TestNode]) -> Vec<usize> {
    (0..nodes.len()).collect()
}
