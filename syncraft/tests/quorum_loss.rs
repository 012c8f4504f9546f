use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use syncraft::FailReason;

mod fixtures;

type OutcomeSlot = Arc<Mutex<Option<Result<Vec<u8>, FailReason>>>>;

fn capture() -> (OutcomeSlot, syncraft::CommandNotify) {
    let slot: OutcomeSlot = Arc::new(Mutex::new(None));
    let inner = slot.clone();
    let notify: syncraft::CommandNotify = Box::new(move |res| {
        *inner.lock().unwrap() = Some(res);
    });
    (slot, notify)
}

/// Quorum-loss behavior with forwarding disabled.
///
/// What does this test do?
///
/// - brings three nodes online, commits 350, then destroys two of them,
///   keeping a follower as the survivor.
/// - asserts the survivor can never elect itself and its commit index never
///   advances.
/// - asserts a submission on the survivor is promptly failed `NotLeader`.
///
/// RUST_LOG=syncraft=debug cargo test -p syncraft --test quorum_loss
#[test]
fn quorum_loss_without_forwarding() -> Result<()> {
    fixtures::init_tracing();

    let addrs = vec![fixtures::next_addr(), fixtures::next_addr(), fixtures::next_addr()];
    let config = fixtures::test_config().forward_to_leader(false).validate()?;
    let mut nodes = fixtures::new_cluster(&addrs, &config);
    let everyone = fixtures::all(&nodes);

    let elected = fixtures::ticks_until(&mut nodes, &everyone, Duration::from_secs(10), |nodes| {
        fixtures::agreed_leader(nodes, &[0, 1, 2]).is_some()
    });
    assert!(elected, "no agreed leader within the election window");
    let leader = fixtures::agreed_leader(&nodes, &everyone).unwrap();

    // Commit some state through the leader while quorum still exists.
    let leader_idx = (0..nodes.len())
        .find(|&i| nodes[i].replica.self_addr() == &leader)
        .unwrap();
    nodes[leader_idx].replica.submit(memapp::add_value(350), None);
    let converged = fixtures::ticks_until(&mut nodes, &everyone, Duration::from_secs(5), |nodes| {
        nodes.iter().all(|n| n.counter() == 350)
    });
    assert!(converged, "counters never converged to 350");

    // Keep one follower; destroy the other two nodes.
    let survivor_idx = (0..nodes.len())
        .find(|&i| nodes[i].replica.self_addr() != &leader)
        .unwrap();
    let survivor_addr = nodes[survivor_idx].replica.self_addr().clone();
    let mut survivor = None;
    for node in nodes.drain(..) {
        if node.replica.self_addr() == &survivor_addr {
            survivor = Some(node);
        } else {
            node.replica.destroy();
        }
    }
    let mut nodes = vec![survivor.unwrap()];

    // Without a quorum the survivor campaigns forever and never wins.
    fixtures::do_ticks(&mut nodes, &[0], Duration::from_secs(4));
    assert_eq!(nodes[0].replica.leader(), None);
    let commit_before = nodes[0].replica.metrics().commit_index;

    let (slot, notify) = capture();
    nodes[0].replica.submit(memapp::add_value(50), Some(notify));
    let fired = fixtures::ticks_until(&mut nodes, &[0], Duration::from_secs(3), {
        let slot = slot.clone();
        move |_| slot.lock().unwrap().is_some()
    });
    assert!(fired, "submission was never failed");
    match slot.lock().unwrap().take().unwrap() {
        Err(FailReason::NotLeader { .. }) => {}
        other => panic!("expected NotLeader, got {:?}", other),
    }

    fixtures::do_ticks(&mut nodes, &[0], Duration::from_secs(1));
    assert_eq!(nodes[0].counter(), 350);
    assert_eq!(nodes[0].replica.metrics().commit_index, commit_before);

    Ok(())
}

/// Quorum-loss behavior with forwarding enabled: once no leader is known,
/// submissions fail `RequestDenied` instead of `NotLeader`.
#[test]
fn quorum_loss_with_forwarding() -> Result<()> {
    fixtures::init_tracing();

    let addrs = vec![fixtures::next_addr(), fixtures::next_addr(), fixtures::next_addr()];
    let config = fixtures::test_config().forward_to_leader(true).validate()?;
    let mut nodes = fixtures::new_cluster(&addrs, &config);
    let everyone = fixtures::all(&nodes);

    let elected = fixtures::ticks_until(&mut nodes, &everyone, Duration::from_secs(10), |nodes| {
        fixtures::agreed_leader(nodes, &[0, 1, 2]).is_some()
    });
    assert!(elected, "no agreed leader within the election window");
    let leader = fixtures::agreed_leader(&nodes, &everyone).unwrap();

    let survivor_addr = nodes
        .iter()
        .map(|n| n.replica.self_addr().clone())
        .find(|addr| addr != &leader)
        .unwrap();
    let mut survivor = None;
    for node in nodes.drain(..) {
        if node.replica.self_addr() == &survivor_addr {
            survivor = Some(node);
        } else {
            node.replica.destroy();
        }
    }
    let mut nodes = vec![survivor.unwrap()];

    // Tick until the stale leader has been forgotten through an election.
    let leaderless = fixtures::ticks_until(&mut nodes, &[0], Duration::from_secs(5), |nodes| {
        nodes[0].replica.leader().is_none()
    });
    assert!(leaderless, "survivor never forgot the dead leader");

    let (slot, notify) = capture();
    nodes[0].replica.submit(memapp::add_value(50), Some(notify));
    let fired = fixtures::ticks_until(&mut nodes, &[0], Duration::from_secs(3), {
        let slot = slot.clone();
        move |_| slot.lock().unwrap().is_some()
    });
    assert!(fired, "submission was never failed");
    match slot.lock().unwrap().take().unwrap() {
        Err(FailReason::RequestDenied) => {}
        other => panic!("expected RequestDenied, got {:?}", other),
    }

    Ok(())
}
