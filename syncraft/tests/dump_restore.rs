use std::time::Duration;

use anyhow::Result;

mod fixtures;

/// Dump-file persistence test.
///
/// What does this test do?
///
/// - brings two nodes online, each with a dump file, and commits 350.
/// - destroys both nodes (which flushes their dumps).
/// - reconstructs both nodes from the same dump files and asserts that,
///   without any new submissions, the counters read 350 after re-election.
///
/// RUST_LOG=syncraft=debug cargo test -p syncraft --test dump_restore
#[test]
fn dump_restore() -> Result<()> {
    fixtures::init_tracing();

    let dir = tempfile::tempdir()?;
    let dumps = vec![dir.path().join("node1.dump"), dir.path().join("node2.dump")];
    let addrs = vec![fixtures::next_addr(), fixtures::next_addr()];

    let config_for = |i: usize| {
        fixtures::test_config()
            .log_compaction_min_entries(1)
            .log_compaction_min_time(Duration::from_millis(100))
            .full_dump_file(dumps[i].clone())
            .validate()
    };

    let mut nodes = vec![
        fixtures::new_node(&addrs[0], &[addrs[1].clone()], config_for(0)?),
        fixtures::new_node(&addrs[1], &[addrs[0].clone()], config_for(1)?),
    ];
    let everyone = fixtures::all(&nodes);

    let elected = fixtures::ticks_until(&mut nodes, &everyone, Duration::from_secs(10), |nodes| {
        fixtures::agreed_leader(nodes, &[0, 1]).is_some()
    });
    assert!(elected, "no agreed leader within the election window");

    nodes[0].replica.submit(memapp::add_value(150), None);
    nodes[1].replica.submit(memapp::add_value(200), None);

    let converged = fixtures::ticks_until(&mut nodes, &everyone, Duration::from_secs(5), |nodes| {
        nodes.iter().all(|n| n.counter() == 350)
    });
    assert!(converged, "counters never converged to 350");

    // Destroying flushes the dump files.
    for node in nodes.drain(..) {
        node.replica.destroy();
    }

    // Reconstruct from the same dump files, with no new submissions.
    let mut nodes = vec![
        fixtures::new_node(&addrs[0], &[addrs[1].clone()], config_for(0)?),
        fixtures::new_node(&addrs[1], &[addrs[0].clone()], config_for(1)?),
    ];

    let restored = fixtures::ticks_until(&mut nodes, &everyone, Duration::from_secs(10), |nodes| {
        fixtures::agreed_leader(nodes, &[0, 1]).is_some() && nodes.iter().all(|n| n.counter() == 350)
    });
    assert!(restored, "counters were not restored to 350 from the dumps");

    Ok(())
}
