//! API route handlers for the gateway.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use std::sync::Arc;

use drip_core::{DripError, SubscriberId};
use drip_scheduler::CancelAck;

use crate::server::AppState;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

/// Map an engine error to its HTTP status and error body.
fn error_response(err: &DripError) -> ApiResponse {
    let status = match err {
        DripError::Conflict(_) => StatusCode::CONFLICT,
        DripError::NotFound(_) => StatusCode::NOT_FOUND,
        DripError::InvalidSubscriber(_) => StatusCode::BAD_REQUEST,
        DripError::ShuttingDown | DripError::Halted(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("❌ Request failed: {err}");
    }
    (
        status,
        Json(serde_json::json!({"ok": false, "error": err.to_string()})),
    )
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "drip-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "resident": state.registry.resident_count(),
        "notifier": state.registry.notifier_name(),
        "listen": format!("{}:{}", state.gateway_config.host, state.gateway_config.port),
    }))
}

/// Start a subscription: `POST /subscribe {"email": ...}`.
pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EmailRequest>,
) -> ApiResponse {
    let id = match SubscriberId::parse(&body.email) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.registry.start(&id) {
        Ok(_) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"message": "Resource created successfully"})),
        ),
        Err(e) => error_response(&e),
    }
}

/// Current details: `GET /get_details?email=...`.
pub async fn get_details(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EmailRequest>,
) -> ApiResponse {
    let id = match SubscriberId::parse(&query.email) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.registry.query(&id) {
        Ok(snapshot) => match serde_json::to_value(&snapshot.details) {
            Ok(details) => (StatusCode::OK, Json(details)),
            Err(e) => error_response(&DripError::from(e)),
        },
        Err(e) => error_response(&e),
    }
}

/// Request cancellation: `DELETE /unsubscribe {"email": ...}`.
/// Answers once the request is accepted, not when the run has terminated.
pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EmailRequest>,
) -> ApiResponse {
    let id = match SubscriberId::parse(&body.email) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.registry.cancel(&id) {
        Ok(ack) => {
            let status = match ack {
                CancelAck::Accepted => "accepted",
                CancelAck::AlreadyCancelling => "already_cancelling",
                CancelAck::AlreadyTerminated => "already_terminated",
            };
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({"message": "Requesting cancellation", "status": status})),
            )
        }
        Err(e) => error_response(&e),
    }
}
