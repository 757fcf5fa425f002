//! REST API handlers for targets, distributions and device reports.
//!
//! Each handler reads/writes via `StateStore` and returns JSON responses.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fleetgrid_core::TargetFilter;
use fleetgrid_state::*;
use tracing::info;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn state_error(e: StateError) -> Response {
    let status = match &e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::Conflict(_) => StatusCode::CONFLICT,
        StateError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

// ── Targets ────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct RegisterTargetRequest {
    pub controller_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(serde::Deserialize, Default)]
pub struct TargetQuery {
    /// Target filter, e.g. `attribute.ring==canary`.
    pub q: Option<String>,
}

/// GET /api/v1/targets
pub async fn list_targets(
    State(state): State<ApiState>,
    Query(query): Query<TargetQuery>,
) -> impl IntoResponse {
    let filter = match query.q.as_deref() {
        Some(q) => match TargetFilter::parse(q) {
            Ok(f) => f,
            Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
        },
        None => TargetFilter::all(),
    };
    match state.store.query_targets(&filter, None) {
        Ok(targets) => ApiResponse::ok(targets).into_response(),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/targets
pub async fn register_target(
    State(state): State<ApiState>,
    Json(req): Json<RegisterTargetRequest>,
) -> impl IntoResponse {
    let name = req.name.as_deref().unwrap_or(&req.controller_id);
    match state
        .store
        .register_target(&req.controller_id, name, req.attributes.clone())
    {
        Ok(target) => {
            info!(controller = %target.controller_id, "target registered");
            (StatusCode::CREATED, ApiResponse::ok(target)).into_response()
        }
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/targets/{id}
pub async fn get_target(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_target(&id) {
        Ok(Some(target)) => ApiResponse::ok(target).into_response(),
        Ok(None) => error_response("target not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/targets/{id}/actions
pub async fn list_target_actions(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_target(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("target not found", StatusCode::NOT_FOUND),
        Err(e) => return state_error(e),
    }
    match state.store.list_target_actions(&id) {
        Ok(actions) => ApiResponse::ok(actions).into_response(),
        Err(e) => state_error(e),
    }
}

// ── Distributions ──────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct CreateDistributionRequest {
    pub name: String,
    pub version: String,
    pub modules: Vec<String>,
}

/// GET /api/v1/distributions
pub async fn list_distributions(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_distributions() {
        Ok(distributions) => ApiResponse::ok(distributions).into_response(),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/distributions
pub async fn create_distribution(
    State(state): State<ApiState>,
    Json(req): Json<CreateDistributionRequest>,
) -> impl IntoResponse {
    match state
        .store
        .create_distribution(&req.name, &req.version, req.modules)
    {
        Ok(dist) => {
            info!(distribution = dist.id, name = %dist.name, version = %dist.version, "distribution created");
            (StatusCode::CREATED, ApiResponse::ok(dist)).into_response()
        }
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/distributions/{id}/invalidate
pub async fn invalidate_distribution(
    State(state): State<ApiState>,
    Path(id): Path<DistributionId>,
) -> impl IntoResponse {
    match state.store.invalidate_distribution(id) {
        Ok(dist) => ApiResponse::ok(dist).into_response(),
        Err(e) => state_error(e),
    }
}

// ── Actions ────────────────────────────────────────────────────

#[derive(serde::Serialize)]
pub struct ActionView {
    #[serde(flatten)]
    pub action: Action,
    pub history: Vec<ActionStatusEntry>,
}

#[derive(serde::Deserialize)]
pub struct StatusReport {
    pub status: ActionStatus,
    #[serde(default)]
    pub message: Option<String>,
}

/// GET /api/v1/actions/{id}
pub async fn get_action(
    State(state): State<ApiState>,
    Path(id): Path<ActionId>,
) -> impl IntoResponse {
    let action = match state.store.get_action(id) {
        Ok(Some(action)) => action,
        Ok(None) => return error_response("action not found", StatusCode::NOT_FOUND),
        Err(e) => return state_error(e),
    };
    match state.store.action_history(id) {
        Ok(history) => ApiResponse::ok(ActionView { action, history }).into_response(),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/actions/{id}/status
pub async fn report_action_status(
    State(state): State<ApiState>,
    Path(id): Path<ActionId>,
    Json(report): Json<StatusReport>,
) -> impl IntoResponse {
    match state
        .store
        .report_action_status(id, report.status, report.message.as_deref())
    {
        Ok(action) => ApiResponse::ok(action).into_response(),
        Err(e) => state_error(e),
    }
}
