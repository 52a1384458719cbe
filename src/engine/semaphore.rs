//! Named counting semaphores
//!
//! Resources name semaphores in their meta-params as `id` or `id:N`;
//! workers acquire every named semaphore in sorted order around
//! check-apply. The stable acquisition order is what prevents deadlock
//! between workers sharing overlapping sets.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{EngineError, EngineResult};
use crate::resource::parse_sema;

use super::token::CancelToken;

/// Process-wide pool of named semaphores, created on first use.
pub struct SemaPool {
    semas: DashMap<String, Arc<Semaphore>>,
}

impl SemaPool {
    pub fn new() -> Self {
        Self {
            semas: DashMap::new(),
        }
    }

    /// Acquire every semaphore named in `ids`, in sorted order.
    ///
    /// Duplicate ids collapse to one acquisition. Cancellation releases
    /// everything taken so far. Pass the returned permits to
    /// [`SemaPool::release`] to drop them in reverse order.
    pub async fn acquire(
        &self,
        ids: &[String],
        ctx: &CancelToken,
    ) -> EngineResult<Vec<OwnedSemaphorePermit>> {
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut permits = Vec::with_capacity(sorted.len());
        for id in sorted {
            let (key, count) = parse_sema(id)?;
            let sema = self
                .semas
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(count)))
                .clone();
            let permit = tokio::select! {
                permit = sema.acquire_owned() => permit
                    .map_err(|_| EngineError::Internal("semaphore closed".to_string()))?,
                _ = ctx.cancelled() => {
                    SemaPool::release(permits);
                    return Err(EngineError::Cancelled);
                }
            };
            permits.push(permit);
        }
        Ok(permits)
    }

    /// Release permits in reverse acquisition order.
    pub fn release(permits: Vec<OwnedSemaphorePermit>) {
        for permit in permits.into_iter().rev() {
            drop(permit);
        }
    }
}

impl Default for SemaPool {
    fn default() -> Self {
        Self::new()
    }
}
