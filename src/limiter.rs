use crate::error::{LimitError, Result};
use crate::metrics::STORE_ERRORS_TOTAL;
use crate::plan::PlanLimits;
use crate::store::LimitStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

// Outcome of a rate limit check. Transient, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    // epoch ms at which the window fully clears
    pub reset_at_ms: i64,
}

impl Decision {
    // Seconds until reset, for Retry-After style headers
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        ((self.reset_at_ms - now_ms).max(0) as u64).div_ceil(1_000)
    }
}

// Sliding-window rate limiter over a shared store. Availability beats
// strictness here: when the store is down or slow, requests are allowed
// through. The usage meter makes the opposite choice.
pub struct RateLimiter {
    store: Arc<dyn LimitStore>,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn LimitStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    // Check and record a request for the subject. Admitted requests consume
    // one unit of window quota; denied attempts consume nothing.
    pub async fn check(&self, subject: &str, limits: &PlanLimits) -> Decision {
        self.check_at(subject, limits, chrono::Utc::now().timestamp_millis())
            .await
    }

    // Read-only variant: reports limit/remaining/reset without consuming
    // quota. Calling it repeatedly never changes the answer.
    pub async fn info(&self, subject: &str, limits: &PlanLimits) -> Decision {
        self.info_at(subject, limits, chrono::Utc::now().timestamp_millis())
            .await
    }

    pub(crate) async fn check_at(&self, subject: &str, limits: &PlanLimits, now_ms: i64) -> Decision {
        let window_ms = limits.window_ms();
        let outcome = self
            .with_timeout(
                self.store
                    .record(subject, now_ms, window_ms, limits.max_requests),
            )
            .await;

        match outcome {
            Ok(rec) => Decision {
                allowed: rec.admitted,
                limit: limits.max_requests,
                remaining: limits.max_requests.saturating_sub(rec.count),
                reset_at_ms: reset_at(rec.oldest_ms, now_ms, window_ms),
            },
            Err(e) => self.fail_open(subject, limits, now_ms, e),
        }
    }

    pub(crate) async fn info_at(&self, subject: &str, limits: &PlanLimits, now_ms: i64) -> Decision {
        let window_ms = limits.window_ms();
        let outcome = self
            .with_timeout(self.store.observe(subject, now_ms, window_ms))
            .await;

        match outcome {
            Ok(view) => Decision {
                allowed: view.count < limits.max_requests,
                limit: limits.max_requests,
                remaining: limits.max_requests.saturating_sub(view.count),
                reset_at_ms: reset_at(view.oldest_ms, now_ms, window_ms),
            },
            Err(e) => self.fail_open(subject, limits, now_ms, e),
        }
    }

    fn fail_open(
        &self,
        subject: &str,
        limits: &PlanLimits,
        now_ms: i64,
        error: LimitError,
    ) -> Decision {
        STORE_ERRORS_TOTAL.inc();
        warn!(subject, error = %error, "rate limit store failure, failing open");
        Decision {
            allowed: true,
            limit: limits.max_requests,
            remaining: 0,
            reset_at_ms: now_ms + limits.window_ms(),
        }
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LimitError::StoreTimeout(self.store_timeout)),
        }
    }
}

// Exact reset: the window clears when the oldest surviving request leaves it
fn reset_at(oldest_ms: Option<i64>, now_ms: i64, window_ms: i64) -> i64 {
    match oldest_ms {
        Some(oldest) => oldest + window_ms,
        None => now_ms + window_ms,
    }
}
