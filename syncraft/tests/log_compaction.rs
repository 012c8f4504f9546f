use std::time::Duration;

use anyhow::Result;

mod fixtures;

/// Log compaction under load, with snapshot-based catch-up.
///
/// What does this test do?
///
/// - brings three nodes online with aggressive compaction thresholds.
/// - commits 1000 increments submitted across two nodes; all counters reach
///   1000 and every live log has been compacted down to the threshold.
/// - isolates the third node and commits another 1000 on the majority.
/// - reconnects the third node, which is now too far behind for log
///   shipping and must be caught up with a snapshot.
///
/// RUST_LOG=syncraft=debug cargo test -p syncraft --test log_compaction
#[test]
fn log_compaction() -> Result<()> {
    fixtures::init_tracing();

    let addrs = vec![fixtures::next_addr(), fixtures::next_addr(), fixtures::next_addr()];
    let config = fixtures::test_config()
        .append_entries_use_batch(true)
        .max_batch_entries(100)
        .log_compaction_min_entries(100)
        .log_compaction_min_time(Duration::from_millis(100))
        .validate()?;
    let mut nodes = fixtures::new_cluster(&addrs, &config);
    let everyone = fixtures::all(&nodes);

    let elected = fixtures::ticks_until(&mut nodes, &everyone, Duration::from_secs(10), |nodes| {
        fixtures::agreed_leader(nodes, &[0, 1, 2]).is_some()
    });
    assert!(elected, "no agreed leader within the election window");

    for _ in 0..500 {
        nodes[0].replica.submit(memapp::add_value(1), None);
        nodes[1].replica.submit(memapp::add_value(1), None);
    }

    let converged = fixtures::ticks_until(&mut nodes, &everyone, Duration::from_secs(15), |nodes| {
        nodes.iter().all(|n| n.counter() == 1000)
    });
    assert!(converged, "counters never converged to 1000");

    // Give the compaction clock a moment past its minimum interval, then
    // every live log must be at or under the threshold.
    fixtures::do_ticks(&mut nodes, &everyone, Duration::from_millis(500));
    for node in nodes.iter() {
        assert!(
            node.replica.log_size() <= 100,
            "live log too large: {} entries on {}",
            node.replica.log_size(),
            node.replica.self_addr()
        );
    }

    // Isolate the third node and keep committing on the majority.
    let majority = vec![0, 1];
    for _ in 0..500 {
        nodes[0].replica.submit(memapp::add_value(1), None);
        nodes[1].replica.submit(memapp::add_value(1), None);
    }
    let advanced = fixtures::ticks_until(&mut nodes, &majority, Duration::from_secs(15), |nodes| {
        nodes[0].counter() == 2000 && nodes[1].counter() == 2000
    });
    assert!(advanced, "majority never reached 2000");
    assert_ne!(nodes[2].counter(), 2000);

    // Reconnect: the majority has long compacted past the isolated node's
    // position, so catch-up happens via InstallSnapshot.
    let caught_up = fixtures::ticks_until(&mut nodes, &everyone, Duration::from_secs(15), |nodes| {
        nodes[2].counter() == 2000
    });
    assert!(caught_up, "isolated node never caught up via snapshot");

    fixtures::do_ticks(&mut nodes, &everyone, Duration::from_millis(500));
    for node in nodes.iter() {
        assert!(node.replica.log_size() <= 100, "live log too large after catch-up");
    }

    Ok(())
}
