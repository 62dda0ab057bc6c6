use axum::{Json, http::StatusCode, response::IntoResponse};

// Representative Novora resource endpoints sitting behind the limits layer.
// The real CRUD lives in the dashboard services; these stand in for them so
// the pipeline can be exercised end to end.

pub async fn create_survey_handler() -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": opaque_id(),
            "created_at": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

pub async fn list_surveys_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "surveys": [] }))
}

pub async fn submit_response_handler() -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": opaque_id(),
            "received_at": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

pub async fn create_report_handler() -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": opaque_id(),
            "status": "queued",
        })),
    )
}

fn opaque_id() -> String {
    format!("{:x}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0))
}
