//! Shared helpers for the integration suites

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use converge::Config;

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_for<F: Fn() -> bool>(cond: F, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Engine config rooted in a test-scoped prefix directory.
pub fn test_config(prefix: &Path) -> Config {
    Config {
        prefix: prefix.to_path_buf(),
        ..Config::default()
    }
}
