#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use common::{MockBehavior, MockFactory, RecordingEvents, RecordingSink, lazy_pool, plan_with};
use mysqlmon::collectors::registry::CollectorRegistry;
use mysqlmon::event::{self, EventSink};
use mysqlmon::metrics::MetricValue;
use mysqlmon::monitor::engine::Engine;
use mysqlmon::monitor::lpc::LevelCollector;
use mysqlmon::sink::Sink;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    lpc: Arc<LevelCollector>,
    engine: Arc<Engine>,
    sink: Arc<RecordingSink>,
    events: Arc<RecordingEvents>,
    handle: tokio::task::JoinHandle<()>,
}

async fn start(domains: &[(&'static str, MockBehavior)], plan: mysqlmon::Plan) -> Harness {
    let registry = Arc::new(CollectorRegistry::new());
    for (domain, behavior) in domains {
        registry
            .register(
                domain,
                Arc::new(MockFactory {
                    domain: *domain,
                    behavior: behavior.clone(),
                }),
            )
            .expect("register mock");
    }
    let events = Arc::new(RecordingEvents::default());
    let engine = Arc::new(Engine::with_registry(
        "db1",
        lazy_pool(),
        Arc::clone(&events) as Arc<dyn EventSink>,
        registry,
    ));
    engine.prepare(plan).await.expect("prepare");

    let sink = Arc::new(RecordingSink::default());
    let lpc = Arc::new(LevelCollector::new(
        Arc::clone(&engine),
        vec![Arc::clone(&sink) as Arc<dyn Sink>],
        Arc::clone(&events) as Arc<dyn EventSink>,
        CancellationToken::new(),
    ));
    let run = Arc::clone(&lpc);
    let handle = tokio::spawn(async move { run.run().await });
    Harness {
        lpc,
        engine,
        sink,
        events,
        handle,
    }
}

async fn stop(harness: Harness) {
    harness.lpc.stop();
    tokio::time::timeout(Duration::from_secs(5), harness.handle)
        .await
        .expect("lpc run must return after stop")
        .expect("lpc task must not panic");
}

#[tokio::test]
async fn test_blocked_tick_skips_without_duplicates() {
    // The collector takes 250ms while the level fires every 100ms: the
    // ticks landing during a collection are skipped with lpc-blocked, not
    // queued.
    let plan = plan_with("p1", &[("fast", Duration::from_millis(100), &["mock.slow"])]);
    let harness = start(
        &[(
            "mock.slow",
            MockBehavior::Sleep(
                Duration::from_millis(250),
                vec![MetricValue::gauge("a", 1.0)],
            ),
        )],
        plan,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(620)).await;
    let blocked = harness.events.count(event::LPC_BLOCKED);
    stop(harness).await;

    assert!(blocked >= 2, "expected skipped ticks, got {blocked}");
}

#[tokio::test]
async fn test_blocked_level_batches_do_not_overlap() {
    let plan = plan_with("p1", &[("fast", Duration::from_millis(100), &["mock.slow"])]);
    let harness = start(
        &[(
            "mock.slow",
            MockBehavior::Sleep(
                Duration::from_millis(250),
                vec![MetricValue::gauge("a", 1.0)],
            ),
        )],
        plan,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(650)).await;
    let sink = Arc::clone(&harness.sink);
    stop(harness).await;

    let batches = sink.batches();
    assert!(batches.len() >= 2, "got {} batches", batches.len());
    // 650ms of 100ms ticks would be 6-7 batches without the skip rule;
    // 250ms collections allow at most one batch per ~300ms.
    assert!(batches.len() <= 3, "got {} batches", batches.len());
    for pair in batches.windows(2) {
        assert!(
            pair[1].begin > pair[0].end,
            "collections for one level must not overlap"
        );
    }
}

#[tokio::test]
async fn test_pause_and_resume_are_idempotent() {
    let plan = plan_with("p1", &[("l1", Duration::from_millis(50), &["mock.ok"])]);
    let harness = start(
        &[(
            "mock.ok",
            MockBehavior::Values(vec![MetricValue::gauge("a", 1.0)]),
        )],
        plan,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    harness.lpc.pause();
    harness.lpc.pause();
    assert_eq!(harness.events.count(event::LPC_PAUSED), 1);
    assert_eq!(harness.lpc.status(), "paused");

    // No new batches while paused (allow in-flight collections to land).
    tokio::time::sleep(Duration::from_millis(100)).await;
    let paused_count = harness.sink.batches().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.sink.batches().len(), paused_count);

    harness.lpc.resume();
    harness.lpc.resume();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(harness.sink.batches().len() > paused_count);
    assert_eq!(harness.lpc.status(), "running");

    stop(harness).await;
}

#[tokio::test]
async fn test_change_plan_swaps_levels() {
    let plan1 = plan_with("p1", &[("only-a", Duration::from_millis(50), &["mock.ok"])]);
    let plan2 = plan_with("p2", &[("only-b", Duration::from_millis(50), &["mock.ok"])]);
    let harness = start(
        &[(
            "mock.ok",
            MockBehavior::Values(vec![MetricValue::gauge("a", 1.0)]),
        )],
        plan1,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(harness.sink.batches().iter().all(|b| b.level == "only-a"));

    harness.lpc.change_plan(plan2).await.expect("change plan");
    // Drop anything produced before or during the swap.
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.sink.drain();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let batches = harness.sink.batches();
    assert!(!batches.is_empty());
    // The first collect under the new plan observes only the new plan's
    // levels.
    for batch in &batches {
        assert_eq!(batch.plan, "p2");
        assert_eq!(batch.level, "only-b");
    }
    assert_eq!(harness.events.count(event::CHANGE_PLAN_SUCCESS), 1);

    stop(harness).await;
}

#[tokio::test]
async fn test_change_plan_failure_keeps_old_plan_running() {
    let plan1 = plan_with("p1", &[("l1", Duration::from_millis(50), &["mock.ok"])]);
    let plan2 = plan_with(
        "p2",
        &[("l2", Duration::from_millis(50), &["mock.ok", "mock.bad"])],
    );
    let harness = start(
        &[
            (
                "mock.ok",
                MockBehavior::Values(vec![MetricValue::gauge("a", 1.0)]),
            ),
            ("mock.bad", MockBehavior::PrepareFail),
        ],
        plan1,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(harness.lpc.change_plan(plan2).await.is_err());
    assert_eq!(harness.events.count(event::CHANGE_PLAN_ERROR), 1);

    // The loop resumed with the previous plan.
    harness.sink.drain();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let batches = harness.sink.batches();
    assert!(!batches.is_empty());
    assert!(batches.iter().all(|b| b.plan == "p1" && b.level == "l1"));
    assert_eq!(harness.engine.plan().await.unwrap().name, "p1");

    stop(harness).await;
}

#[tokio::test]
async fn test_tied_levels_fire_fastest_first() {
    // Both levels come due at startup; the faster one must be fired (and
    // therefore produce its first batch) first.
    let plan = plan_with(
        "p1",
        &[
            ("slow-level", Duration::from_millis(400), &["mock.ok"]),
            ("fast-level", Duration::from_millis(100), &["mock.ok"]),
        ],
    );
    let harness = start(
        &[(
            "mock.ok",
            MockBehavior::Values(vec![MetricValue::gauge("a", 1.0)]),
        )],
        plan,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    let batches = harness.sink.batches();
    stop(harness).await;

    let first_fast = batches.iter().position(|b| b.level == "fast-level");
    let first_slow = batches.iter().position(|b| b.level == "slow-level");
    match (first_fast, first_slow) {
        (Some(fast), Some(slow)) => assert!(fast < slow),
        (Some(_), None) => {}
        other => panic!("unexpected batch order: {other:?}"),
    }
}

#[tokio::test]
async fn test_stop_drains_outstanding_collections() {
    let plan = plan_with("p1", &[("l1", Duration::from_millis(50), &["mock.slow"])]);
    let harness = start(
        &[(
            "mock.slow",
            MockBehavior::Sleep(
                Duration::from_millis(200),
                vec![MetricValue::gauge("a", 1.0)],
            ),
        )],
        plan,
    )
    .await;

    // Stop while a collection is in flight; run() must still return.
    tokio::time::sleep(Duration::from_millis(80)).await;
    stop(harness).await;
}
