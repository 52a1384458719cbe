//! Per-vertex event throttling
//!
//! Implements the `limit`/`burst` meta-params as a token bucket: the
//! worker reserves one token per process cycle, and an infinite limit
//! short-circuits to a no-op.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::error::{EngineError, EngineResult};
use crate::resource::MetaParams;

use super::token::CancelToken;

/// Token bucket guarding one worker's process cycles.
pub struct EventLimiter {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl EventLimiter {
    /// Build from meta-params. An infinite limit yields an unlimited
    /// limiter; `meta.validate()` has already rejected a zero burst with
    /// a finite limit.
    pub fn from_meta(meta: &MetaParams) -> EngineResult<Self> {
        if !meta.limit.is_finite() {
            return Ok(Self { limiter: None });
        }
        let period = Duration::from_secs_f64(1.0 / meta.limit);
        let quota = Quota::with_period(period).ok_or_else(|| {
            EngineError::Validate(format!("limit {} yields an empty period", meta.limit))
        })?;
        let burst = NonZeroU32::new(meta.burst).ok_or_else(|| {
            EngineError::Validate("burst must be positive with a finite limit".to_string())
        })?;
        Ok(Self {
            limiter: Some(RateLimiter::direct(quota.allow_burst(burst))),
        })
    }

    /// Reserve one token, waiting as needed. Cancellation wins the race.
    pub async fn throttle(&self, ctx: &CancelToken) -> EngineResult<()> {
        let limiter = match &self.limiter {
            Some(l) => l,
            None => return Ok(()),
        };
        tokio::select! {
            _ = limiter.until_ready() => Ok(()),
            _ = ctx.cancelled() => Err(EngineError::Cancelled),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.limiter.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let limiter = EventLimiter::from_meta(&MetaParams::default()).unwrap_or(EventLimiter {
            limiter: None,
        });
        let ctx = CancelToken::new();
        for _ in 0..100 {
            assert!(limiter.throttle(&ctx).await.is_ok());
        }
    }

    #[tokio::test]
    async fn finite_limit_spends_burst_then_waits() {
        let meta = MetaParams {
            limit: 10.0,
            burst: 2,
            ..MetaParams::default()
        };
        let limiter = match EventLimiter::from_meta(&meta) {
            Ok(l) => l,
            Err(e) => panic!("limiter construction failed: {}", e),
        };
        assert!(limiter.is_limited());
        let ctx = CancelToken::new();
        let start = std::time::Instant::now();
        // burst of two is free, the third waits about one period
        limiter.throttle(&ctx).await.ok();
        limiter.throttle(&ctx).await.ok();
        limiter.throttle(&ctx).await.ok();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
