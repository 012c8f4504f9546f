use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use memapp::CounterResponse;
use syncraft::FailReason;

mod fixtures;

/// Submission callback test.
///
/// What does this test do?
///
/// - brings three nodes online and elects a leader.
/// - submits `AddValue(3)` with a completion callback.
/// - asserts the callback fires exactly once, successfully, carrying the
///   replicated method's return value (the new counter value, 3).
///
/// RUST_LOG=syncraft=debug cargo test -p syncraft --test submit_callback
#[test]
fn submit_callback() -> Result<()> {
    fixtures::init_tracing();

    let addrs = vec![fixtures::next_addr(), fixtures::next_addr(), fixtures::next_addr()];
    let config = fixtures::test_config().validate()?;
    let mut nodes = fixtures::new_cluster(&addrs, &config);
    let everyone = fixtures::all(&nodes);

    let elected = fixtures::ticks_until(&mut nodes, &everyone, Duration::from_secs(10), |nodes| {
        fixtures::agreed_leader(nodes, &[0, 1, 2]).is_some()
    });
    assert!(elected, "no agreed leader within the election window");

    let outcome: Arc<Mutex<Option<Result<Vec<u8>, FailReason>>>> = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    nodes[0].replica.submit(
        memapp::add_value(3),
        Some(Box::new(move |res| {
            *slot.lock().unwrap() = Some(res);
        })),
    );

    let fired = fixtures::ticks_until(&mut nodes, &everyone, Duration::from_secs(5), {
        let outcome = outcome.clone();
        move |_| outcome.lock().unwrap().is_some()
    });
    assert!(fired, "completion callback never fired");

    let res = outcome.lock().unwrap().take().unwrap();
    let bytes = res.expect("submission should have succeeded");
    assert_eq!(CounterResponse::decode(&bytes), Some(CounterResponse(3)));

    // The command replicated everywhere, not just on the accepting node.
    let converged = fixtures::ticks_until(&mut nodes, &everyone, Duration::from_secs(5), |nodes| {
        nodes.iter().all(|n| n.counter() == 3)
    });
    assert!(converged, "counters never converged to 3");

    Ok(())
}
