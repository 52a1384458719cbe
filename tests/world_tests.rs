//! Local KV and world tests: on-disk layout, cache behavior, watch
//! notifications, cancellation, and the exchange store.

use converge::engine::CancelToken;
use converge::world::{LocalKv, LocalWorld, WireRes, World};
use converge::EngineError;

#[tokio::test]
async fn get_of_absent_key_is_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kv = LocalKv::new(dir.path().join("value"));
    let ctx = CancelToken::new();
    assert_eq!(kv.get(&ctx, "missing").await.expect("get"), None);
}

#[tokio::test]
async fn set_then_get_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kv = LocalKv::new(dir.path().join("value"));
    let ctx = CancelToken::new();

    kv.set(&ctx, "greeting", "hello world").await.expect("set");
    assert_eq!(
        kv.get(&ctx, "greeting").await.expect("get"),
        Some("hello world".to_string())
    );

    // a fresh store over the same directory reads through the files
    let cold = LocalKv::new(dir.path().join("value"));
    assert_eq!(
        cold.get(&ctx, "greeting").await.expect("cold get"),
        Some("hello world".to_string())
    );
}

#[tokio::test]
async fn on_disk_format_is_base64_with_trailing_newline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kv = LocalKv::new(dir.path().join("value"));
    let ctx = CancelToken::new();
    kv.set(&ctx, "k", "hello").await.expect("set");

    let raw = std::fs::read_to_string(dir.path().join("value").join("k")).expect("read file");
    assert_eq!(raw, "aGVsbG8=\n");
}

#[cfg(unix)]
#[tokio::test]
async fn on_disk_permissions_are_restrictive() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let kv = LocalKv::new(dir.path().join("value"));
    let ctx = CancelToken::new();
    kv.set(&ctx, "secret", "v").await.expect("set");

    let dir_mode = std::fs::metadata(dir.path().join("value"))
        .expect("dir meta")
        .permissions()
        .mode();
    assert_eq!(dir_mode & 0o777, 0o755);
    let file_mode = std::fs::metadata(dir.path().join("value").join("secret"))
        .expect("file meta")
        .permissions()
        .mode();
    assert_eq!(file_mode & 0o777, 0o600);
}

#[tokio::test]
async fn watchers_are_level_triggered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kv = LocalKv::new(dir.path().join("value"));
    let ctx = CancelToken::new();

    let mut watcher = kv.watch("k");
    // two writes coalesce into at least one pending notification
    kv.set(&ctx, "k", "v1").await.expect("set");
    kv.set(&ctx, "k", "v2").await.expect("set");
    assert!(watcher.recv().await.is_some());

    // an unrelated key does not notify this watcher
    kv.set(&ctx, "other", "v").await.expect("set");
    assert!(watcher.try_recv().is_err());

    // deletion notifies too
    kv.del(&ctx, "k").await.expect("del");
    assert!(watcher.recv().await.is_some());
    assert_eq!(kv.get(&ctx, "k").await.expect("get"), None);
}

#[tokio::test]
async fn cancelled_context_aborts_operations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kv = LocalKv::new(dir.path().join("value"));
    let ctx = CancelToken::new();
    ctx.cancel();

    assert!(matches!(
        kv.set(&ctx, "k", "v").await,
        Err(EngineError::Cancelled)
    ));
    assert!(matches!(
        kv.get(&ctx, "k").await,
        Err(EngineError::Cancelled)
    ));
    // nothing surfaced to readers
    let fresh = CancelToken::new();
    assert_eq!(kv.get(&fresh, "k").await.expect("get"), None);
}

#[tokio::test]
async fn keys_with_path_separators_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kv = LocalKv::new(dir.path().join("value"));
    let ctx = CancelToken::new();
    assert!(kv.set(&ctx, "a/b", "v").await.is_err());
    assert!(kv.set(&ctx, "..", "v").await.is_err());
    assert!(kv.set(&ctx, "", "v").await.is_err());
}

#[tokio::test]
async fn exchange_store_is_idempotent_and_filters_by_host() {
    let dir = tempfile::tempdir().expect("tempdir");
    let world = LocalWorld::new(dir.path().to_path_buf(), "h1");

    let wire = |host: &str, data: &str| WireRes {
        kind: "noop".to_string(),
        name: "x".to_string(),
        host: host.to_string(),
        data: data.to_string(),
    };
    world.export_resource(wire("h1", "one")).await.expect("export");
    world.export_resource(wire("*", "any")).await.expect("export");
    // re-export replaces in place
    world.export_resource(wire("h1", "two")).await.expect("export");

    let collected = world.collect_resources("noop", "h1").await.expect("collect");
    assert_eq!(collected.len(), 2);
    assert!(collected.iter().any(|w| w.data == "two"));
    assert!(collected.iter().any(|w| w.data == "any"));

    let elsewhere = world.collect_resources("noop", "h9").await.expect("collect");
    assert_eq!(elsewhere.len(), 1); // only the wildcard

    world
        .unexport_resource("noop", "x", "h1")
        .await
        .expect("unexport");
    let after = world.collect_resources("noop", "h1").await.expect("collect");
    assert_eq!(after.len(), 1);
}

#[tokio::test]
async fn string_and_map_stores_work_through_the_world_trait() {
    let dir = tempfile::tempdir().expect("tempdir");
    let world = LocalWorld::new(dir.path().to_path_buf(), "h1");

    world.str_set("k", "v").await.expect("set");
    assert_eq!(world.str_get("k").await.expect("get"), Some("v".to_string()));

    world.map_set("ns", "a", "1").await.expect("map set");
    world.map_set("ns", "b", "2").await.expect("map set");
    world.map_del("ns", "a").await.expect("map del");
    let all = world.map_all("ns").await.expect("map all");
    assert_eq!(all.len(), 1);
    assert_eq!(all.get("b"), Some(&"2".to_string()));

    assert_eq!(
        world.scheduled("ns", 1).await.expect("scheduled"),
        vec!["h1".to_string()]
    );
    assert_eq!(world.hostname(), "h1");
}
