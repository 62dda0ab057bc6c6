mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::Result;
use crate::plan::Resource;

// Outcome of recording a request attempt against a sliding window
#[derive(Debug, Clone, Copy)]
pub struct WindowRecord {
    pub admitted: bool,
    // requests in the window after this call (includes the new one when admitted)
    pub count: u32,
    // oldest surviving timestamp, for exact reset computation
    pub oldest_ms: Option<i64>,
}

// Read-only view of a window; never consumes quota
#[derive(Debug, Clone, Copy)]
pub struct WindowView {
    pub count: u32,
    pub oldest_ms: Option<i64>,
}

// Outcome of an atomic usage increment-and-check
#[derive(Debug, Clone, Copy)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    // counter value after the call
    pub current: i64,
}

// Backing store for sliding-window logs and per-tenant usage counters.
// Shared across all subject keys and all service instances; correctness of
// the usage counters depends on the per-key atomicity each backend provides
// (entry lock in memory, INCR in Redis).
#[async_trait::async_trait]
pub trait LimitStore: Send + Sync {
    // Purge timestamps older than now - window, then admit and record the
    // request if fewer than max_requests remain. Denied attempts are not
    // recorded.
    async fn record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        max_requests: u32,
    ) -> Result<WindowRecord>;

    // Purge and count without recording anything
    async fn observe(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<WindowView>;

    // Atomically increment the tenant's counter for a resource and check it
    // against the cap in the same operation. A negative limit is unlimited:
    // always allowed, still counted.
    async fn try_consume(
        &self,
        tenant: &str,
        resource: Resource,
        limit: i64,
    ) -> Result<ConsumeOutcome>;

    async fn resource_usage(&self, tenant: &str, resource: Resource) -> Result<i64>;

    // Reset hook for billing-period rollover, driven externally
    async fn set_usage(&self, tenant: &str, resource: Resource, value: i64) -> Result<()>;

    // Drop window entries idle for longer than idle_ms. Returns the number
    // of entries removed; backends with native TTLs may do nothing.
    async fn sweep(&self, now_ms: i64, idle_ms: i64) -> Result<usize>;
}

// Store double whose every call fails, for exercising the fail-open and
// fail-closed policies.
#[cfg(test)]
pub struct FailingStore;

#[cfg(test)]
#[async_trait::async_trait]
impl LimitStore for FailingStore {
    async fn record(&self, _: &str, _: i64, _: i64, _: u32) -> Result<WindowRecord> {
        Err(crate::error::LimitError::StoreUnavailable(
            "injected failure".to_string(),
        ))
    }

    async fn observe(&self, _: &str, _: i64, _: i64) -> Result<WindowView> {
        Err(crate::error::LimitError::StoreUnavailable(
            "injected failure".to_string(),
        ))
    }

    async fn try_consume(&self, _: &str, _: Resource, _: i64) -> Result<ConsumeOutcome> {
        Err(crate::error::LimitError::StoreUnavailable(
            "injected failure".to_string(),
        ))
    }

    async fn resource_usage(&self, _: &str, _: Resource) -> Result<i64> {
        Err(crate::error::LimitError::StoreUnavailable(
            "injected failure".to_string(),
        ))
    }

    async fn set_usage(&self, _: &str, _: Resource, _: i64) -> Result<()> {
        Err(crate::error::LimitError::StoreUnavailable(
            "injected failure".to_string(),
        ))
    }

    async fn sweep(&self, _: i64, _: i64) -> Result<usize> {
        Ok(0)
    }
}
