use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, Histogram, register_counter, register_gauge, register_histogram};

lazy_static! {
    pub static ref REQUESTS_TOTAL: Counter = register_counter!(
        "novora_limits_requests_total",
        "Requests seen by the limits middleware"
    )
    .unwrap();
    pub static ref RATE_LIMITED_TOTAL: Counter = register_counter!(
        "novora_limits_rate_limited_total",
        "Requests denied by the sliding-window rate limiter"
    )
    .unwrap();
    pub static ref USAGE_DENIED_TOTAL: Counter = register_counter!(
        "novora_limits_usage_denied_total",
        "Requests denied by resource usage caps"
    )
    .unwrap();
    pub static ref STORE_ERRORS_TOTAL: Counter = register_counter!(
        "novora_limits_store_errors_total",
        "Backing store failures and timeouts"
    )
    .unwrap();
    pub static ref DECISION_LATENCY: Histogram = register_histogram!(
        "novora_limits_decision_latency_seconds",
        "Time spent deciding rate limit and usage checks"
    )
    .unwrap();
    pub static ref WINDOW_ENTRIES: Gauge = register_gauge!(
        "novora_limits_window_entries",
        "Subject window entries held by the in-memory store"
    )
    .unwrap();
}
