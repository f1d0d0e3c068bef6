//! Engine with pluggable persistence, routing, and caching

pub mod builder;
pub mod memory;
pub mod traits;

pub use builder::{CascadeEngine, CascadeEngineBuilder};

use std::future::Future;

use crate::error::Result;

/// Run `op` again while it fails with an optimistic conflict
///
/// At most `attempts` runs; the last error is returned as is.
pub async fn retry_on_conflict<F, Fut, T>(attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < attempts => {
                tracing::debug!(attempt, error = %e, "Optimistic conflict, retrying");
                attempt += 1;
                tokio::task::yield_now().await;
            },
            other => return other,
        }
    }
}
