use crate::error::{LimitError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

// Subscription tier. Unknown tiers resolve to Basic rather than failing the
// request (fail open to basic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    // Lenient parse used for header/config values; None means unknown
    pub fn parse(s: &str) -> Option<Tier> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Some(Tier::Basic),
            "pro" => Some(Tier::Pro),
            "enterprise" => Some(Tier::Enterprise),
            _ => None,
        }
    }
}

// Metered Novora resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Surveys,
    Responses,
    Storage,
    TeamMembers,
    ApiCalls,
    CustomReports,
}

impl Resource {
    pub const ALL: [Resource; 6] = [
        Resource::Surveys,
        Resource::Responses,
        Resource::Storage,
        Resource::TeamMembers,
        Resource::ApiCalls,
        Resource::CustomReports,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Surveys => "surveys",
            Resource::Responses => "responses",
            Resource::Storage => "storage",
            Resource::TeamMembers => "team_members",
            Resource::ApiCalls => "api_calls",
            Resource::CustomReports => "custom_reports",
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const UNLIMITED: i64 = -1;

// Per-tier quotas. Immutable - looked up, never mutated.
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub tier: Tier,
    pub window: Duration,
    pub max_requests: u32,
    surveys: i64,
    responses: i64,
    storage: i64,
    team_members: i64,
    api_calls: i64,
    custom_reports: i64,
}

impl PlanLimits {
    pub fn for_tier(tier: Tier) -> PlanLimits {
        match tier {
            Tier::Basic => PlanLimits {
                tier,
                window: Duration::from_millis(60_000),
                max_requests: 60,
                surveys: 10,
                responses: 1_000,
                storage: 512,
                team_members: 5,
                api_calls: 10_000,
                custom_reports: 3,
            },
            Tier::Pro => PlanLimits {
                tier,
                window: Duration::from_millis(60_000),
                max_requests: 300,
                surveys: 100,
                responses: 50_000,
                storage: 10_240,
                team_members: 25,
                api_calls: 100_000,
                custom_reports: 50,
            },
            Tier::Enterprise => PlanLimits {
                tier,
                window: Duration::from_millis(60_000),
                max_requests: 1_000,
                surveys: UNLIMITED,
                responses: UNLIMITED,
                storage: UNLIMITED,
                team_members: UNLIMITED,
                api_calls: UNLIMITED,
                custom_reports: UNLIMITED,
            },
        }
    }

    // Cap for a resource; UNLIMITED (-1) means no cap
    pub fn resource_limit(&self, resource: Resource) -> i64 {
        match resource {
            Resource::Surveys => self.surveys,
            Resource::Responses => self.responses,
            Resource::Storage => self.storage,
            Resource::TeamMembers => self.team_members,
            Resource::ApiCalls => self.api_calls,
            Resource::CustomReports => self.custom_reports,
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window.as_millis() as i64
    }
}

// Subscription record as seen by this service. Storage of subscriptions is
// an external concern; we only need the lookup contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub tenant_id: String,
    pub tier: Tier,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Suspended,
}

#[async_trait::async_trait]
pub trait SubscriptionLookup: Send + Sync {
    // None when the tenant has no subscription record
    async fn current_subscription(&self, tenant_id: &str) -> Result<Option<Subscription>>;
}

// In-process subscription table. Used by the binary and as the test double.
#[derive(Default)]
pub struct InProcessSubscriptions {
    records: DashMap<String, Subscription>,
}

impl InProcessSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, tenant_id: &str, tier: Tier) {
        self.records.insert(
            tenant_id.to_string(),
            Subscription {
                tenant_id: tenant_id.to_string(),
                tier,
                status: SubscriptionStatus::Active,
            },
        );
    }

    // Payment failures etc. A suspended tenant keeps its record but is
    // served the default tier until reinstated.
    pub fn suspend(&self, tenant_id: &str) {
        if let Some(mut record) = self.records.get_mut(tenant_id) {
            record.status = SubscriptionStatus::Suspended;
        }
    }
}

#[async_trait::async_trait]
impl SubscriptionLookup for InProcessSubscriptions {
    async fn current_subscription(&self, tenant_id: &str) -> Result<Option<Subscription>> {
        Ok(self.records.get(tenant_id).map(|r| r.value().clone()))
    }
}

struct CachedTier {
    tier: Tier,
    cached_at_ms: i64,
}

// Maps a tenant to its PlanLimits via the subscription store, with a small
// TTL cache. Invalidated explicitly on subscription change.
pub struct PlanResolver {
    subscriptions: Arc<dyn SubscriptionLookup>,
    cache: DashMap<String, CachedTier>,
    cache_ttl_ms: i64,
    default_tier: Tier,
}

impl PlanResolver {
    pub fn new(subscriptions: Arc<dyn SubscriptionLookup>, default_tier: Tier) -> Self {
        Self {
            subscriptions,
            cache: DashMap::new(),
            cache_ttl_ms: 30_000,
            default_tier,
        }
    }

    // Resolve a tenant's limits. Never fails: a missing record, suspended
    // subscription, or lookup error all fall back to the default tier.
    pub async fn resolve(&self, tenant_id: &str) -> PlanLimits {
        let now_ms = chrono::Utc::now().timestamp_millis();

        if let Some(hit) = self.cache.get(tenant_id) {
            if now_ms - hit.cached_at_ms < self.cache_ttl_ms {
                return PlanLimits::for_tier(hit.tier);
            }
        }

        let tier = match self.subscriptions.current_subscription(tenant_id).await {
            Ok(Some(sub)) if sub.status == SubscriptionStatus::Active => sub.tier,
            Ok(Some(sub)) => {
                warn!(tenant = tenant_id, status = ?sub.status, "subscription not active, applying default tier");
                self.default_tier
            }
            Ok(None) => {
                warn!(tenant = tenant_id, "no subscription record, applying default tier");
                self.default_tier
            }
            Err(e) => {
                warn!(tenant = tenant_id, error = %e, "subscription lookup failed, applying default tier");
                self.default_tier
            }
        };

        self.cache.insert(
            tenant_id.to_string(),
            CachedTier {
                tier,
                cached_at_ms: now_ms,
            },
        );
        PlanLimits::for_tier(tier)
    }

    // Drop the cached tier so the next resolve sees the new subscription
    pub fn invalidate(&self, tenant_id: &str) {
        self.cache.remove(tenant_id);
    }

    // Limits applied when no tenant can be identified; bypasses the cache
    pub fn default_limits(&self) -> PlanLimits {
        PlanLimits::for_tier(self.default_tier)
    }

    // Drop entries past their TTL so the cache stays bounded by active
    // tenants. Run from the background sweep tick.
    pub fn evict_expired(&self, now_ms: i64) -> usize {
        let before = self.cache.len();
        self.cache
            .retain(|_, hit| now_ms - hit.cached_at_ms < self.cache_ttl_ms);
        before.saturating_sub(self.cache.len())
    }
}

// Lookup double that always fails, for exercising the fallback path
pub struct FailingSubscriptions;

#[async_trait::async_trait]
impl SubscriptionLookup for FailingSubscriptions {
    async fn current_subscription(&self, tenant_id: &str) -> Result<Option<Subscription>> {
        Err(LimitError::SubscriptionLookup {
            tenant: tenant_id.to_string(),
            reason: "subscription store offline".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_active_subscription_tier() {
        let subs = Arc::new(InProcessSubscriptions::new());
        subs.upsert("acme", Tier::Pro);
        let resolver = PlanResolver::new(subs, Tier::Basic);

        let limits = resolver.resolve("acme").await;
        assert_eq!(limits.tier, Tier::Pro);
        assert_eq!(limits.max_requests, 300);
    }

    #[tokio::test]
    async fn missing_subscription_falls_back_to_default() {
        let subs = Arc::new(InProcessSubscriptions::new());
        let resolver = PlanResolver::new(subs, Tier::Basic);

        let limits = resolver.resolve("ghost").await;
        assert_eq!(limits.tier, Tier::Basic);
        assert_eq!(limits.max_requests, 60);
    }

    #[tokio::test]
    async fn suspended_subscription_served_default_tier() {
        let subs = Arc::new(InProcessSubscriptions::new());
        subs.upsert("acme", Tier::Enterprise);
        let resolver = PlanResolver::new(subs.clone(), Tier::Basic);

        subs.suspend("acme");
        let limits = resolver.resolve("acme").await;
        assert_eq!(limits.tier, Tier::Basic);
    }

    #[tokio::test]
    async fn lookup_failure_falls_back_to_default() {
        let resolver = PlanResolver::new(Arc::new(FailingSubscriptions), Tier::Basic);
        let limits = resolver.resolve("acme").await;
        assert_eq!(limits.tier, Tier::Basic);
    }

    #[tokio::test]
    async fn invalidate_picks_up_tier_change() {
        let subs = Arc::new(InProcessSubscriptions::new());
        subs.upsert("acme", Tier::Basic);
        let resolver = PlanResolver::new(subs.clone(), Tier::Basic);

        assert_eq!(resolver.resolve("acme").await.tier, Tier::Basic);

        subs.upsert("acme", Tier::Enterprise);
        // cached value still served until invalidated
        assert_eq!(resolver.resolve("acme").await.tier, Tier::Basic);

        resolver.invalidate("acme");
        assert_eq!(resolver.resolve("acme").await.tier, Tier::Enterprise);
    }

    #[tokio::test]
    async fn evict_expired_drops_stale_cache_entries() {
        let subs = Arc::new(InProcessSubscriptions::new());
        subs.upsert("acme", Tier::Pro);
        let resolver = PlanResolver::new(subs, Tier::Basic);

        resolver.resolve("acme").await;
        resolver.resolve("drive-by").await; // default-tier lookups cache too
        assert_eq!(resolver.cache.len(), 2);

        let later = chrono::Utc::now().timestamp_millis() + resolver.cache_ttl_ms + 1;
        assert_eq!(resolver.evict_expired(later), 2);
        assert_eq!(resolver.cache.len(), 0);

        // fresh entries survive a sweep
        resolver.resolve("acme").await;
        let now = chrono::Utc::now().timestamp_millis();
        assert_eq!(resolver.evict_expired(now), 0);
        assert_eq!(resolver.cache.len(), 1);
    }

    #[test]
    fn unlimited_is_negative_one() {
        let limits = PlanLimits::for_tier(Tier::Enterprise);
        assert_eq!(limits.resource_limit(Resource::Surveys), UNLIMITED);
        let basic = PlanLimits::for_tier(Tier::Basic);
        assert_eq!(basic.resource_limit(Resource::Surveys), 10);
    }
}
