//! Engine integration tests: worker lifecycle, notify/refresh, retries,
//! pause/resume, rate limiting, and send/recv data flow.

mod common;

use std::sync::Arc;
use std::time::Duration;

use converge::testing::{tracing_init, EventRes, NoopRes, SinkRes, ValueRes};
use converge::{interpret, Config, EdgeSpec, Engine, LocalWorld, ResKey, WorkerStatus};

use common::{test_config, wait_for};

fn build_engine(config: Config) -> Engine {
    let world = Arc::new(LocalWorld::new(config.prefix.clone(), &config.hostname));
    Engine::new(config, world).expect("engine construction")
}

/// Scenario: a single trivial resource converges exactly once at startup;
/// a second invocation reports no change.
#[tokio::test(flavor = "multi_thread")]
async fn trivial_converge() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = build_engine(test_config(dir.path()));

    let (res, probe) = NoopRes::with_comment("a", "hello");
    let assembly = interpret(vec![res], vec![]).expect("assembly");
    engine.commit(assembly).await.expect("commit");

    assert!(wait_for(|| probe.checks() >= 1, 2000).await);
    assert_eq!(probe.checks(), 1);
    assert_eq!(probe.applies(), 1);

    // second invocation: no change
    let key = ResKey::new("noop", "a");
    assert!(engine.poke(&key));
    assert!(wait_for(|| probe.checks() >= 2, 2000).await);
    assert_eq!(probe.applies(), 1);

    engine.shutdown().await.expect("shutdown");
    assert_eq!(probe.cleanups(), 1);
}

/// Noop mode checks but never applies.
#[tokio::test(flavor = "multi_thread")]
async fn noop_mode_reports_pending_without_applying() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = build_engine(test_config(dir.path()));

    let (mut res, probe) = NoopRes::create("a");
    res.meta_mut().noop = true;
    let assembly = interpret(vec![res], vec![]).expect("assembly");
    engine.commit(assembly).await.expect("commit");

    assert!(wait_for(|| probe.checks() >= 1, 2000).await);
    assert_eq!(probe.applies(), 0);
    engine.shutdown().await.expect("shutdown");
}

/// Scenario: an A -> B notify edge delivers a refresh to exactly one
/// downstream check-apply per source converge-with-change.
#[tokio::test(flavor = "multi_thread")]
async fn notify_edge_refreshes_downstream_once() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = build_engine(test_config(dir.path()));

    let (a, trigger, a_probe) = EventRes::quiet("a");
    let (b, b_probe) = NoopRes::create("b");
    let edges = vec![EdgeSpec::between("event", "a", "noop", "b").with_notify()];
    let assembly = interpret(vec![a, b], edges).expect("assembly");
    engine.commit(assembly).await.expect("commit");

    // both settle their startup checks first (a's is quiet)
    assert!(wait_for(|| a_probe.checks() >= 1 && b_probe.checks() >= 1, 2000).await);
    assert_eq!(b_probe.refresh_log(), vec![false]);

    // drive A to converge with change
    trigger.send(()).expect("trigger");
    assert!(wait_for(|| b_probe.checks() >= 2, 2000).await);
    assert_eq!(b_probe.refresh_log(), vec![false, true]);

    // the next invocation no longer sees the refresh
    engine.poke(&ResKey::new("noop", "b"));
    assert!(wait_for(|| b_probe.checks() >= 3, 2000).await);
    assert_eq!(b_probe.refresh_log(), vec![false, true, false]);

    engine.shutdown().await.expect("shutdown");
}

/// Transient failures consume the retry budget and then succeed.
#[tokio::test(flavor = "multi_thread")]
async fn retry_budget_recovers_transient_failures() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = build_engine(test_config(dir.path()));

    let (mut res, _trigger, probe) = EventRes::with_failures("r", 2);
    res.meta_mut().retry = 5;
    res.meta_mut().delay = 10;
    let assembly = interpret(vec![res], vec![]).expect("assembly");
    engine.commit(assembly).await.expect("commit");

    assert!(wait_for(|| probe.applies() >= 1, 3000).await);
    assert_eq!(probe.checks(), 3); // two failures, one success
    assert!(!engine.degraded());
    engine.shutdown().await.expect("shutdown");
}

/// An exhausted budget isolates the vertex and marks the engine degraded.
#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_fail_permanently() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = build_engine(test_config(dir.path()));

    let (mut res, _trigger, probe) = EventRes::with_failures("r", 100);
    res.meta_mut().retry = 1;
    res.meta_mut().delay = 10;
    let assembly = interpret(vec![res], vec![]).expect("assembly");
    engine.commit(assembly).await.expect("commit");

    let key = ResKey::new("event", "r");
    assert!(
        wait_for(
            || engine.vertex_status(&key) == Some(WorkerStatus::Done),
            3000
        )
        .await
    );
    assert_eq!(probe.checks(), 2); // initial attempt plus one retry
    assert!(engine.degraded());
    assert_eq!(probe.cleanups(), 1);
    engine.shutdown().await.expect("shutdown");
}

/// After a pause acknowledges, no check-apply runs until resume.
#[tokio::test(flavor = "multi_thread")]
async fn pause_excludes_check_apply_until_resume() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = build_engine(test_config(dir.path()));

    let (res, trigger, probe) = EventRes::quiet("p");
    let assembly = interpret(vec![res], vec![]).expect("assembly");
    engine.commit(assembly).await.expect("commit");
    assert!(wait_for(|| probe.checks() >= 1, 2000).await);

    let key = ResKey::new("event", "p");
    engine.pause(&key).await.expect("pause");
    let before = probe.checks();

    trigger.send(()).expect("trigger");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(probe.checks(), before);

    engine.resume(&key).await.expect("resume");
    assert!(wait_for(|| probe.checks() > before, 2000).await);
    engine.shutdown().await.expect("shutdown");
}

/// The token bucket bounds check-apply invocations by limit * T + burst.
#[tokio::test(flavor = "multi_thread")]
async fn rate_limit_bounds_invocations() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = build_engine(test_config(dir.path()));

    let (mut res, trigger, probe) = EventRes::quiet("rl");
    res.meta_mut().limit = 2.0;
    res.meta_mut().burst = 1;
    let assembly = interpret(vec![res], vec![]).expect("assembly");
    engine.commit(assembly).await.expect("commit");

    let start = tokio::time::Instant::now();
    while start.elapsed() < Duration::from_millis(1000) {
        let _ = trigger.send(());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // limit 2/s over ~1.1s plus burst 1, with headroom for timing jitter
    assert!(probe.checks() >= 1);
    assert!(
        probe.checks() <= 5,
        "rate limit exceeded: {} checks",
        probe.checks()
    );
    engine.shutdown().await.expect("shutdown");
}

/// Send values become visible to the receiver with the changed flag on
/// exactly one snapshot.
#[tokio::test(flavor = "multi_thread")]
async fn send_values_arrive_with_one_shot_changed_flag() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = build_engine(test_config(dir.path()));

    let (sender, _sender_probe) = ValueRes::create("src", "hello");
    let (sink, sink_probe) = SinkRes::create("dst");
    let edges =
        vec![EdgeSpec::between("value", "src", "sink", "dst").with_sendrecv("value", "value")];
    let assembly = interpret(vec![sender, sink], edges).expect("assembly");
    engine.commit(assembly).await.expect("commit");

    // the sender's converge pokes the sink; eventually one snapshot shows
    // the delivered value with changed set
    assert!(
        wait_for(
            || {
                sink_probe.recv_log().iter().any(|snap| {
                    snap.get("value")
                        .map(|v| v.changed && v.value == serde_json::json!("hello"))
                        .unwrap_or(false)
                })
            },
            3000
        )
        .await
    );

    // after observing the change, the next snapshot is quiet
    let seen = sink_probe.recv_log().len();
    engine.poke(&ResKey::new("sink", "dst"));
    assert!(wait_for(|| sink_probe.recv_log().len() > seen, 2000).await);
    let log = sink_probe.recv_log();
    let last = log.last().expect("snapshot");
    assert!(!last.get("value").expect("field").changed);
    assert_eq!(last.get("value").expect("field").value, serde_json::json!("hello"));

    engine.shutdown().await.expect("shutdown");
}

/// Shared semaphores with count one serialize check-applies; the engine
/// still converges everything.
#[tokio::test(flavor = "multi_thread")]
async fn semaphores_serialize_but_do_not_deadlock() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = build_engine(test_config(dir.path()));

    let mut resources = Vec::new();
    let mut probes = Vec::new();
    for name in ["s1", "s2", "s3"] {
        let (mut res, probe) = NoopRes::create(name);
        res.meta_mut().sema = vec!["shared".to_string(), "extra:2".to_string()];
        resources.push(res);
        probes.push(probe);
    }
    let assembly = interpret(resources, vec![]).expect("assembly");
    engine.commit(assembly).await.expect("commit");

    assert!(wait_for(|| probes.iter().all(|p| p.applies() >= 1), 3000).await);
    engine.shutdown().await.expect("shutdown");
}

/// Poll mode replaces the native watch with an interval ticker.
#[tokio::test(flavor = "multi_thread")]
async fn poll_mode_reconverges_on_interval() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = build_engine(test_config(dir.path()));

    let (mut res, probe) = NoopRes::create("polled");
    res.meta_mut().poll = 1;
    let assembly = interpret(vec![res], vec![]).expect("assembly");
    engine.commit(assembly).await.expect("commit");

    // startup converge plus at least one polled re-check
    assert!(wait_for(|| probe.checks() >= 2, 3000).await);
    assert_eq!(probe.applies(), 1);
    engine.shutdown().await.expect("shutdown");
}

/// Queryable peers appear in each other's filtered graph view, minus
/// themselves.
#[tokio::test(flavor = "multi_thread")]
async fn filtered_graph_lists_willing_peers() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = build_engine(test_config(dir.path()));

    let (a, a_probe) = NoopRes::create("a");
    let (b, _) = NoopRes::create("b");
    let (c, _, _) = EventRes::create("c"); // not queryable
    let assembly = interpret(vec![a, b, c], vec![]).expect("assembly");
    engine.commit(assembly).await.expect("commit");

    assert!(wait_for(|| a_probe.checks() >= 1, 2000).await);
    let peers = a_probe.peers();
    assert!(peers.contains(&ResKey::new("noop", "b")));
    assert!(!peers.contains(&ResKey::new("noop", "a")));
    assert!(!peers.contains(&ResKey::new("event", "c")));
    engine.shutdown().await.expect("shutdown");
}

/// With `retryreset`, a converge-with-change restores the retry budget,
/// so later failures get a fresh allowance.
#[tokio::test(flavor = "multi_thread")]
async fn retry_reset_restores_the_budget() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = build_engine(test_config(dir.path()));

    let (mut res, trigger, probe, budget) = converge::testing::EventRes::flaky("rr");
    res.meta_mut().retry = 1;
    res.meta_mut().retry_reset = true;
    res.meta_mut().delay = 10;
    let assembly = interpret(vec![res], vec![]).expect("assembly");
    engine.commit(assembly).await.expect("commit");
    assert!(wait_for(|| probe.checks() >= 1, 2000).await); // quiet startup

    // first round: one failure consumes the budget, the success restores it
    budget.store(1, std::sync::atomic::Ordering::SeqCst);
    trigger.send(()).expect("trigger");
    assert!(wait_for(|| probe.applies() >= 1, 3000).await);
    assert!(!engine.degraded());

    // second round: another failure must still be retriable
    budget.store(1, std::sync::atomic::Ordering::SeqCst);
    trigger.send(()).expect("trigger");
    assert!(wait_for(|| probe.applies() >= 2, 3000).await);
    assert!(!engine.degraded());
    engine.shutdown().await.expect("shutdown");
}

/// The per-resource scratch directory is created on demand under the
/// prefix.
#[tokio::test(flavor = "multi_thread")]
async fn var_dir_is_created_under_the_prefix() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let world = Arc::new(LocalWorld::new(config.prefix.clone(), config.hostname.clone()));
    let key = ResKey::new("noop", "scratch");
    let handle = converge::testing::mock_handle(world, key);
    // the mock handle writes under the system temp dir; the engine path
    // is covered by the config helper
    assert!(handle.var_dir("sub").is_ok());
    assert_eq!(
        config.var_dir("noop", "scratch"),
        dir.path().join("var").join("noop").join("scratch")
    );
}

/// With a converged-timeout configured, the engine reports convergence
/// once everything is clean.
#[tokio::test(flavor = "multi_thread")]
async fn converged_notification_fires() {
    tracing_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.converged_timeout = Some(0);
    let engine = build_engine(config);

    let (res, probe) = NoopRes::create("c");
    let assembly = interpret(vec![res], vec![]).expect("assembly");
    engine.commit(assembly).await.expect("commit");

    assert!(wait_for(|| probe.checks() >= 1, 2000).await);
    let mut converged = engine.converged();
    let fired = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if *converged.borrow() {
                return true;
            }
            if converged.changed().await.is_err() {
                return false;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(fired);
    engine.shutdown().await.expect("shutdown");
}
