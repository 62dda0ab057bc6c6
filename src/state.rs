use crate::limiter::RateLimiter;
use crate::plan::{InProcessSubscriptions, PlanResolver, Tier};
use crate::store::LimitStore;
use crate::usage::UsageMeter;
use std::sync::Arc;
use std::time::Duration;

// app's shared state, constructed once at startup and passed by handle.
// No singletons: everything that needs the store gets it injected here.
pub struct AppState {
    pub limiter: RateLimiter,
    pub meter: UsageMeter,
    pub plans: PlanResolver,
    pub subscriptions: Arc<InProcessSubscriptions>,
}

impl AppState {
    pub fn new(store: Arc<dyn LimitStore>, store_timeout: Duration, default_tier: Tier) -> Self {
        let subscriptions = Arc::new(InProcessSubscriptions::new());
        Self {
            limiter: RateLimiter::new(store.clone(), store_timeout),
            meter: UsageMeter::new(store, store_timeout),
            plans: PlanResolver::new(subscriptions.clone(), default_tier),
            subscriptions,
        }
    }
}
