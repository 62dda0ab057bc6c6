use crate::plan::Tier;
use crate::state::AppState;
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SetSubscriptionBody {
    pub tenant_id: String,
    pub tier: Tier,
}

// Subscription change hook (upgrade/downgrade). Invalidates the resolver
// cache so the new tier takes effect on the next request.
pub async fn set_subscription_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetSubscriptionBody>,
) -> impl IntoResponse {
    state.subscriptions.upsert(&body.tenant_id, body.tier);
    state.plans.invalidate(&body.tenant_id);
    info!(tenant = %body.tenant_id, tier = body.tier.as_str(), "subscription updated");

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "tenant": body.tenant_id,
            "tier": body.tier.as_str(),
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct ResetUsageBody {
    pub tenant_id: String,
}

// Billing-period rollover: zero every usage counter for the tenant.
// Expected to be driven by an external scheduler.
pub async fn reset_usage_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResetUsageBody>,
) -> impl IntoResponse {
    match state.meter.reset(&body.tenant_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "tenant": body.tenant_id, "reset": true })),
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
