use crate::error::Result;
use crate::metrics::STORE_ERRORS_TOTAL;
use crate::plan::{PlanLimits, Resource, UNLIMITED};
use crate::store::LimitStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

// Outcome of a usage check. `current` is the counter value after the call.
#[derive(Debug, Clone, Copy)]
pub struct UsageDecision {
    pub allowed: bool,
    pub resource: Resource,
    pub limit: i64,
    pub current: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceUsage {
    pub usage: i64,
    pub limit: i64,
}

// Cumulative per-tenant resource metering, independent of time windows.
// Billing integrity beats availability here: a store failure propagates and
// the caller denies, the opposite of the rate limiter's fail-open policy.
pub struct UsageMeter {
    store: Arc<dyn LimitStore>,
    store_timeout: Duration,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn LimitStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    // Atomically consume one unit of the resource if the tenant's cap
    // allows it. A cap of -1 is unlimited: always allowed, still counted.
    pub async fn try_consume(
        &self,
        tenant: &str,
        resource: Resource,
        limits: &PlanLimits,
    ) -> Result<UsageDecision> {
        let limit = limits.resource_limit(resource);
        let outcome = self
            .with_timeout(self.store.try_consume(tenant, resource, limit))
            .await
            .inspect_err(|e| {
                STORE_ERRORS_TOTAL.inc();
                warn!(tenant, resource = %resource, error = %e, "usage store failure, failing closed");
            })?;

        Ok(UsageDecision {
            allowed: outcome.allowed,
            resource,
            limit,
            current: outcome.current,
        })
    }

    // Availability check without consuming: true when under the cap
    pub async fn available(
        &self,
        tenant: &str,
        resource: Resource,
        limits: &PlanLimits,
    ) -> Result<bool> {
        let limit = limits.resource_limit(resource);
        if limit == UNLIMITED {
            return Ok(true);
        }
        let current = self
            .with_timeout(self.store.resource_usage(tenant, resource))
            .await?;
        Ok(current < limit)
    }

    // Snapshot of every metered resource for reporting and headers
    pub async fn snapshot(
        &self,
        tenant: &str,
        limits: &PlanLimits,
    ) -> Result<BTreeMap<&'static str, ResourceUsage>> {
        let mut report = BTreeMap::new();
        for resource in Resource::ALL {
            let usage = self
                .with_timeout(self.store.resource_usage(tenant, resource))
                .await?;
            report.insert(
                resource.as_str(),
                ResourceUsage {
                    usage,
                    limit: limits.resource_limit(resource),
                },
            );
        }
        Ok(report)
    }

    // Billing-period rollover hook, driven by an external scheduler
    pub async fn reset(&self, tenant: &str) -> Result<()> {
        for resource in Resource::ALL {
            self.with_timeout(self.store.set_usage(tenant, resource, 0))
                .await?;
        }
        Ok(())
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(crate::error::LimitError::StoreTimeout(self.store_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Tier;
    use crate::store::{FailingStore, MemoryStore};

    fn meter() -> UsageMeter {
        UsageMeter::new(Arc::new(MemoryStore::new()), Duration::from_millis(250))
    }

    #[tokio::test]
    async fn consumes_up_to_cap_then_denies() {
        let meter = meter();
        let limits = PlanLimits::for_tier(Tier::Basic); // surveys cap = 10

        for i in 1..=10 {
            let d = meter.try_consume("acme", Resource::Surveys, &limits).await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.current, i);
        }

        let d = meter.try_consume("acme", Resource::Surveys, &limits).await.unwrap();
        assert!(!d.allowed);
        // counter never exceeds a finite cap
        assert_eq!(d.current, 10);
        assert!(!meter.available("acme", Resource::Surveys, &limits).await.unwrap());
    }

    #[tokio::test]
    async fn unlimited_cap_always_allows() {
        let meter = meter();
        let limits = PlanLimits::for_tier(Tier::Enterprise);

        for _ in 0..500 {
            let d = meter.try_consume("acme", Resource::Surveys, &limits).await.unwrap();
            assert!(d.allowed);
        }
        assert!(meter.available("acme", Resource::Surveys, &limits).await.unwrap());
    }

    #[tokio::test]
    async fn usage_is_monotone_within_a_period() {
        let meter = meter();
        let limits = PlanLimits::for_tier(Tier::Basic);

        let mut last = 0;
        for _ in 0..15 {
            let d = meter.try_consume("acme", Resource::Surveys, &limits).await.unwrap();
            assert!(d.current >= last);
            last = d.current;
        }
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let meter = UsageMeter::new(Arc::new(FailingStore), Duration::from_millis(250));
        let limits = PlanLimits::for_tier(Tier::Basic);

        let err = meter
            .try_consume("acme", Resource::Surveys, &limits)
            .await
            .unwrap_err();
        assert!(err.is_store_failure());
    }

    #[tokio::test]
    async fn snapshot_reports_every_resource() {
        let meter = meter();
        let limits = PlanLimits::for_tier(Tier::Basic);

        meter.try_consume("acme", Resource::Surveys, &limits).await.unwrap();
        meter.try_consume("acme", Resource::Surveys, &limits).await.unwrap();

        let report = meter.snapshot("acme", &limits).await.unwrap();
        assert_eq!(report.len(), Resource::ALL.len());
        assert_eq!(report["surveys"].usage, 2);
        assert_eq!(report["surveys"].limit, 10);
        assert_eq!(report["responses"].usage, 0);
    }

    #[tokio::test]
    async fn reset_clears_all_counters() {
        let meter = meter();
        let limits = PlanLimits::for_tier(Tier::Basic);

        meter.try_consume("acme", Resource::Surveys, &limits).await.unwrap();
        meter.reset("acme").await.unwrap();

        let report = meter.snapshot("acme", &limits).await.unwrap();
        assert_eq!(report["surveys"].usage, 0);
    }
}
