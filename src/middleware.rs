use crate::metrics::{DECISION_LATENCY, RATE_LIMITED_TOTAL, REQUESTS_TOTAL, USAGE_DENIED_TOTAL};
use crate::plan::Resource;
use crate::state::AppState;
use crate::usage::UsageDecision;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, Response, StatusCode, header::HeaderValue},
    middleware::Next,
    response::IntoResponse,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

// Paths that bypass all limiting. The usage endpoint is excluded so a
// tenant at its cap can still see why.
const EXCLUDED_PREFIXES: &[&str] = &["/health", "/metrics", "/api/usage", "/internal"];

// Static endpoint-category table. POSTs to a mapped prefix consume one unit
// of the mapped resource; everything else meters as a plain API call.
const RESOURCE_ROUTES: &[(&str, &str, Resource)] = &[
    ("/api/surveys", "surveys", Resource::Surveys),
    ("/api/responses", "responses", Resource::Responses),
    ("/api/reports", "reports", Resource::CustomReports),
    ("/api/team", "team", Resource::TeamMembers),
];

fn categorize(path: &str) -> (&'static str, Resource) {
    for (prefix, category, resource) in RESOURCE_ROUTES {
        if path.starts_with(prefix) {
            return (category, *resource);
        }
    }
    ("api", Resource::ApiCalls)
}

// Subject identity: authenticated user id from the upstream auth layer,
// else client IP. Inability to identify the subject never fails the request.
fn subject_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(user) = headers.get("x-user-id").and_then(|v| v.to_str().ok()) {
        if !user.is_empty() {
            return format!("user:{}", user);
        }
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return format!("ip:{}", first);
            }
        }
    }
    match peer {
        Some(addr) => format!("ip:{}", addr.ip()),
        None => "anonymous".to_string(),
    }
}

// Billing identity. Only a real tenant or user id qualifies; IP-derived
// subjects are rate-limited but never metered, otherwise every distinct
// client IP would leave permanent usage counters behind.
pub(crate) fn tenant_id(headers: &HeaderMap, subject: &str) -> Option<String> {
    if let Some(tenant) = headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
    {
        return Some(tenant.to_string());
    }
    subject.starts_with("user:").then(|| subject.to_string())
}

// The limits pipeline: subject extraction -> plan resolution -> rate limit
// -> usage metering -> headers. The only component that touches the
// request/response boundary.
pub async fn limits_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let path = request.uri().path().to_string();
    if EXCLUDED_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return next.run(request).await;
    }

    REQUESTS_TOTAL.inc();
    let timer = DECISION_LATENCY.start_timer();

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let subject = subject_id(request.headers(), peer);
    let tenant = tenant_id(request.headers(), &subject);
    let (category, resource) = categorize(&path);
    let is_create = request.method() == axum::http::Method::POST;

    let limits = match &tenant {
        Some(tenant) => state.plans.resolve(tenant).await,
        None => state.plans.default_limits(),
    };

    // rate limit first; the limiter fails open internally on store trouble
    let subject_key = format!("{}:{}", subject, category);
    let decision = state.limiter.check(&subject_key, &limits).await;
    let now_ms = chrono::Utc::now().timestamp_millis();

    if !decision.allowed {
        RATE_LIMITED_TOTAL.inc();
        timer.observe_duration();
        let retry_after = decision.retry_after_secs(now_ms);
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({
                "error": "Rate limit exceeded",
                "message": format!(
                    "Too many requests for the {} plan. Try again in {} seconds.",
                    limits.tier.as_str(), retry_after
                ),
                "retryAfter": retry_after,
            })),
        )
            .into_response();
        set_rate_headers(response.headers_mut(), &decision);
        if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert("Retry-After", v);
        }
        return response;
    }

    // usage metering; fail-closed, so a store outage denies here
    let consumed_resource = if is_create { resource } else { Resource::ApiCalls };
    let mut usage = None;
    if let Some(tenant) = &tenant {
        match state
            .meter
            .try_consume(tenant, consumed_resource, &limits)
            .await
        {
            Ok(u) => usage = Some(u),
            Err(e) => {
                timer.observe_duration();
                let mut response = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    axum::Json(serde_json::json!({
                        "error": "Usage check unavailable",
                        "message": "Usage metering is temporarily unavailable. Please retry.",
                    })),
                )
                    .into_response();
                warn!(tenant = %tenant, error = %e, "denying request, usage store unavailable");
                set_rate_headers(response.headers_mut(), &decision);
                return response;
            }
        }
    }

    if let Some(usage) = usage.filter(|u| !u.allowed) {
        USAGE_DENIED_TOTAL.inc();
        timer.observe_duration();
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({
                "error": "Resource limit exceeded",
                "message": format!(
                    "The {} plan allows {} {}. Upgrade to raise this limit.",
                    limits.tier.as_str(), usage.limit, usage.resource
                ),
            })),
        )
            .into_response();
        set_rate_headers(response.headers_mut(), &decision);
        set_usage_headers(response.headers_mut(), &usage);
        return response;
    }

    timer.observe_duration();
    let mut response = next.run(request).await;
    set_rate_headers(response.headers_mut(), &decision);
    if let Some(usage) = &usage {
        set_usage_headers(response.headers_mut(), usage);
    }
    response
}

fn set_rate_headers(headers: &mut HeaderMap, decision: &crate::limiter::Decision) {
    insert_num(headers, "X-RateLimit-Limit", decision.limit as i64);
    insert_num(headers, "X-RateLimit-Remaining", decision.remaining as i64);
    insert_num(headers, "X-RateLimit-Reset", decision.reset_at_ms);
}

fn set_usage_headers(headers: &mut HeaderMap, usage: &UsageDecision) {
    insert_num(headers, "X-Usage-Limit", usage.limit);
    insert_num(headers, "X-Usage-Current", usage.current);
}

fn insert_num(headers: &mut HeaderMap, name: &'static str, value: i64) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Tier;
    use crate::store::{FailingStore, LimitStore, MemoryStore};
    use axum::{
        Router, middleware,
        routing::{get, post},
    };
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn stub_created() -> impl IntoResponse {
        (StatusCode::CREATED, axum::Json(serde_json::json!({"id": 1})))
    }

    async fn stub_ok() -> impl IntoResponse {
        axum::Json(serde_json::json!({"items": []}))
    }

    fn app_with_store(store: Arc<dyn LimitStore>) -> (Router, Arc<AppState>) {
        let state = Arc::new(AppState::new(
            store,
            Duration::from_millis(250),
            Tier::Basic,
        ));
        let router = Router::new()
            .route("/api/surveys", post(stub_created).get(stub_ok))
            .route("/api/responses", post(stub_created))
            .route("/health", get(stub_ok))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                limits_middleware,
            ))
            .with_state(state.clone());
        (router, state)
    }

    fn app() -> (Router, Arc<AppState>) {
        app_with_store(Arc::new(MemoryStore::new()))
    }

    fn get_req(path: &str, user: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("x-user-id", user)
            .body(Body::empty())
            .unwrap()
    }

    fn post_req(path: &str, user: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("x-user-id", user)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn header<'a>(response: &'a Response<Body>, name: &str) -> &'a str {
        response.headers().get(name).unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn annotates_allowed_responses_with_limit_headers() {
        let (router, _) = app();

        let response = router.oneshot(get_req("/api/surveys", "u1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "X-RateLimit-Limit"), "60");
        assert_eq!(header(&response, "X-RateLimit-Remaining"), "59");
        assert!(response.headers().contains_key("X-RateLimit-Reset"));
        // GET meters as a plain API call
        assert_eq!(header(&response, "X-Usage-Limit"), "10000");
        assert_eq!(header(&response, "X-Usage-Current"), "1");
    }

    #[tokio::test]
    async fn sixty_first_request_in_window_gets_429_with_retry_after() {
        let (router, _) = app();

        for i in 0..60u32 {
            let response = router
                .clone()
                .oneshot(get_req("/api/surveys", "u1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "request {}", i + 1);
            let remaining: u32 = header(&response, "X-RateLimit-Remaining").parse().unwrap();
            assert_eq!(remaining, 59 - i);
        }

        let response = router.oneshot(get_req("/api/surveys", "u1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "X-RateLimit-Remaining"), "0");
        let retry_after: u64 = header(&response, "Retry-After").parse().unwrap();
        assert!(retry_after <= 60);

        let body = body_json(response).await;
        assert_eq!(body["error"], "Rate limit exceeded");
        assert!(body["retryAfter"].as_u64().unwrap() <= 60);
    }

    #[tokio::test]
    async fn subjects_are_limited_independently() {
        let (router, _) = app();

        for _ in 0..60 {
            router
                .clone()
                .oneshot(get_req("/api/surveys", "u1"))
                .await
                .unwrap();
        }
        let response = router.oneshot(get_req("/api/surveys", "u2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn survey_cap_exhaustion_names_the_resource() {
        let (router, state) = app();

        // basic plan allows 10 surveys
        for _ in 0..10 {
            let response = router
                .clone()
                .oneshot(post_req("/api/surveys", "u1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = router
            .clone()
            .oneshot(post_req("/api/surveys", "u1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "X-Usage-Current"), "10");

        let body = body_json(response).await;
        assert_eq!(body["error"], "Resource limit exceeded");
        assert!(body["message"].as_str().unwrap().contains("surveys"));

        // denied create did not consume quota elsewhere
        let d = state
            .meter
            .snapshot("user:u1", &crate::plan::PlanLimits::for_tier(Tier::Basic))
            .await
            .unwrap();
        assert_eq!(d["surveys"].usage, 10);
    }

    #[tokio::test]
    async fn missing_subscription_applies_basic_defaults() {
        let (router, _) = app();

        // tenant never provisioned; limiter still answers with basic limits
        let response = router
            .oneshot(get_req("/api/surveys", "nobody"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "X-RateLimit-Limit"), "60");
    }

    #[tokio::test]
    async fn pro_tenant_gets_pro_limits() {
        let (router, state) = app();
        state.subscriptions.upsert("acme", Tier::Pro);

        let request = Request::builder()
            .uri("/api/surveys")
            .header("x-user-id", "u1")
            .header("x-tenant-id", "acme")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(header(&response, "X-RateLimit-Limit"), "300");
    }

    #[tokio::test]
    async fn excluded_paths_bypass_all_checks() {
        let (router, _) = app();

        let response = router.oneshot(get_req("/health", "u1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("X-RateLimit-Limit"));
    }

    #[tokio::test]
    async fn anonymous_requests_fall_back_to_ip_key() {
        let (router, _) = app();

        let request = Request::builder()
            .uri("/api/surveys")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        // identified by IP, never hard-failed
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "X-RateLimit-Remaining"), "59");
    }

    #[tokio::test]
    async fn anonymous_traffic_is_rate_limited_but_not_metered() {
        let (router, state) = app();

        let request = Request::builder()
            .uri("/api/surveys")
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("X-RateLimit-Limit"));
        assert!(!response.headers().contains_key("X-Usage-Limit"));

        // no usage counter cells left behind for the IP-derived identity
        let report = state
            .meter
            .snapshot(
                "ip:203.0.113.9",
                &crate::plan::PlanLimits::for_tier(Tier::Basic),
            )
            .await
            .unwrap();
        assert!(report.values().all(|r| r.usage == 0));
    }

    #[tokio::test]
    async fn store_outage_is_open_for_rate_limit_closed_for_usage() {
        let (router, _) = app_with_store(Arc::new(FailingStore));

        // the limiter failed open, then the fail-closed meter denied
        let response = router.oneshot(get_req("/api/surveys", "u1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["error"], "Usage check unavailable");
    }

    #[tokio::test]
    async fn response_creates_meter_the_responses_resource() {
        let (router, state) = app();

        router
            .clone()
            .oneshot(post_req("/api/responses", "u1"))
            .await
            .unwrap();

        let report = state
            .meter
            .snapshot("user:u1", &crate::plan::PlanLimits::for_tier(Tier::Basic))
            .await
            .unwrap();
        assert_eq!(report["responses"].usage, 1);
        assert_eq!(report["surveys"].usage, 0);
    }
}
