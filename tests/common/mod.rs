//! Common test utilities for integration tests.

pub mod fixtures;
pub mod origin;

use std::time::{Duration, Instant};

/// Poll `predicate` until it holds or the timeout elapses. Detached work
/// (cache fills, promotions) lands asynchronously, so assertions on it need
/// a grace window.
pub async fn eventually<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
