//! REST API handlers for rollout management.
//!
//! All calls go through [`RolloutManagement`](fleetgrid_rollout::RolloutManagement),
//! which authorizes the caller and validates the transition.

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use fleetgrid_rollout::{Caller, CreateRolloutRequest, Permission, RolloutError};
use fleetgrid_state::{GroupId, RolloutId};
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response};

pub const USER_HEADER: &str = "x-fleet-user";
pub const PERMISSIONS_HEADER: &str = "x-fleet-permissions";

const DEFAULT_PAGE: usize = 100;

/// Build the caller from the identity headers.
///
/// `x-fleet-permissions` is a comma separated list such as
/// `READ_ROLLOUT,HANDLE_ROLLOUT`. Unknown names are ignored.
pub fn caller_from_headers(headers: &HeaderMap) -> Caller {
    let name = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous");
    let permissions = headers
        .get(PERMISSIONS_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .split(',')
        .filter(|p| !p.trim().is_empty())
        .filter_map(|p| {
            let parsed = Permission::parse(p);
            if parsed.is_none() {
                warn!(user = name, permission = p.trim(), "unknown permission ignored");
            }
            parsed
        })
        .collect::<Vec<_>>();
    Caller::new(name, permissions)
}

fn rollout_error(e: RolloutError) -> Response {
    let status = match &e {
        RolloutError::NotFound(_) => StatusCode::NOT_FOUND,
        RolloutError::StateConflict(_) | RolloutError::AlreadyExists(_) => StatusCode::CONFLICT,
        RolloutError::InvalidConfig(_) | RolloutError::Filter(_) => StatusCode::BAD_REQUEST,
        RolloutError::Forbidden(_) => StatusCode::FORBIDDEN,
        RolloutError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

fn respond<T: serde::Serialize>(result: Result<T, RolloutError>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => rollout_error(e),
    }
}

#[derive(serde::Deserialize, Default)]
pub struct Page {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

// ── Rollouts ───────────────────────────────────────────────────

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    respond(state.management.list_rollouts(&caller_from_headers(&headers)))
}

/// POST /api/v1/rollouts
pub async fn create_rollout(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<CreateRolloutRequest>,
) -> impl IntoResponse {
    match state
        .management
        .create_rollout(&caller_from_headers(&headers), req)
    {
        Ok(rollout) => (StatusCode::CREATED, ApiResponse::ok(rollout)).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// GET /api/v1/rollouts/{id}
pub async fn get_rollout_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<RolloutId>,
) -> impl IntoResponse {
    respond(
        state
            .management
            .get_rollout_status(&caller_from_headers(&headers), id),
    )
}

/// DELETE /api/v1/rollouts/{id}
pub async fn delete_rollout(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<RolloutId>,
) -> impl IntoResponse {
    respond(
        state
            .management
            .delete_rollout(&caller_from_headers(&headers), id)
            .map(|()| "deleted"),
    )
}

/// POST /api/v1/rollouts/{id}/start
pub async fn start_rollout(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<RolloutId>,
) -> impl IntoResponse {
    respond(state.management.start_rollout(&caller_from_headers(&headers), id))
}

/// POST /api/v1/rollouts/{id}/pause
pub async fn pause_rollout(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<RolloutId>,
) -> impl IntoResponse {
    respond(state.management.pause_rollout(&caller_from_headers(&headers), id))
}

/// POST /api/v1/rollouts/{id}/resume
pub async fn resume_rollout(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<RolloutId>,
) -> impl IntoResponse {
    respond(state.management.resume_rollout(&caller_from_headers(&headers), id))
}

/// POST /api/v1/rollouts/{id}/stop
pub async fn stop_rollout(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<RolloutId>,
) -> impl IntoResponse {
    respond(state.management.stop_rollout(&caller_from_headers(&headers), id))
}

/// POST /api/v1/rollouts/{id}/trigger-next-group
pub async fn trigger_next_group(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<RolloutId>,
) -> impl IntoResponse {
    respond(
        state
            .management
            .trigger_next_group(&caller_from_headers(&headers), id),
    )
}

// ── Groups ─────────────────────────────────────────────────────

/// GET /api/v1/rollouts/{id}/groups
pub async fn list_groups(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<RolloutId>,
) -> impl IntoResponse {
    respond(
        state
            .management
            .list_group_status(&caller_from_headers(&headers), id),
    )
}

/// GET /api/v1/groups/{id}
pub async fn get_group_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<GroupId>,
) -> impl IntoResponse {
    respond(
        state
            .management
            .get_group_status(&caller_from_headers(&headers), id),
    )
}

/// GET /api/v1/groups/{id}/targets?offset=&limit=
pub async fn list_group_targets(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<GroupId>,
    Query(page): Query<Page>,
) -> impl IntoResponse {
    respond(state.management.list_group_targets(
        &caller_from_headers(&headers),
        id,
        page.offset.unwrap_or(0),
        page.limit.unwrap_or(DEFAULT_PAGE),
    ))
}

// ── Events ─────────────────────────────────────────────────────

/// GET /api/v1/events — SSE stream of rollout events, one `rollout` event
/// per [`RolloutEvent`](fleetgrid_rollout::RolloutEvent) as JSON.
pub async fn watch_events(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let caller = caller_from_headers(&headers);
    if let Err(e) = state.management.authorize_events(&caller) {
        return rollout_error(e);
    }
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(move |msg| match msg {
        Ok(event) => match Event::default().event("rollout").json_data(&event) {
            Ok(sse) => Some(Ok::<Event, Infallible>(sse)),
            Err(e) => {
                warn!(error = %e, "event not serializable");
                None
            }
        },
        Err(e) => {
            warn!(user = %caller.name, error = %e, "event subscriber lagged");
            None
        }
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}
