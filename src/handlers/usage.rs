use crate::middleware::tenant_id;
use crate::state::AppState;
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;

// Per-tenant usage snapshot. Deliberately outside the limits layer so a
// tenant at its cap can still see why.
pub async fn usage_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let subject = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|u| !u.is_empty())
        .map(|u| format!("user:{}", u))
        .unwrap_or_else(|| "anonymous".to_string());

    let Some(tenant) = tenant_id(&headers, &subject) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "Missing tenant identity",
                "message": "Provide an x-tenant-id or x-user-id header.",
            })),
        );
    };

    let limits = state.plans.resolve(&tenant).await;

    match state.meter.snapshot(&tenant, &limits).await {
        Ok(resources) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "tenant": tenant,
                "tier": limits.tier.as_str(),
                "resources": resources,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "Usage check unavailable",
                "message": e.to_string(),
            })),
        ),
    }
}
