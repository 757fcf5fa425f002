//! fleetgrid-api — REST API for FleetGrid.
//!
//! Provides axum route handlers for registering targets, managing
//! distributions and driving rollouts. The caller identity is taken from the
//! `x-fleet-user` and `x-fleet-permissions` headers.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/targets` | List targets, optionally filtered by `?q=` |
//! | POST | `/api/v1/targets` | Register a target |
//! | GET | `/api/v1/targets/{id}` | Get a target |
//! | GET | `/api/v1/targets/{id}/actions` | List a target's actions |
//! | GET | `/api/v1/distributions` | List distributions |
//! | POST | `/api/v1/distributions` | Create a distribution |
//! | POST | `/api/v1/distributions/{id}/invalidate` | Invalidate a distribution |
//! | GET | `/api/v1/actions/{id}` | Get an action with its status history |
//! | POST | `/api/v1/actions/{id}/status` | Report a device status |
//! | GET | `/api/v1/rollouts` | List rollouts |
//! | POST | `/api/v1/rollouts` | Create a rollout |
//! | GET | `/api/v1/rollouts/{id}` | Rollout status with group counts |
//! | DELETE | `/api/v1/rollouts/{id}` | Delete a terminal rollout |
//! | POST | `/api/v1/rollouts/{id}/start` | Start a ready rollout |
//! | POST | `/api/v1/rollouts/{id}/pause` | Pause a running rollout |
//! | POST | `/api/v1/rollouts/{id}/resume` | Resume a paused rollout |
//! | POST | `/api/v1/rollouts/{id}/stop` | Stop a rollout |
//! | POST | `/api/v1/rollouts/{id}/trigger-next-group` | Finish the running group and start the next |
//! | GET | `/api/v1/rollouts/{id}/groups` | Group status list |
//! | GET | `/api/v1/groups/{id}` | Group status |
//! | GET | `/api/v1/groups/{id}/targets` | Group members, paged |
//! | GET | `/api/v1/events` | Rollout events as server-sent events |

pub mod handlers;
pub mod rollout_handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use fleetgrid_rollout::{BroadcastSink, RolloutManagement};
use fleetgrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub management: Arc<RolloutManagement>,
    /// Source of the `/events` stream.
    pub events: BroadcastSink,
}

/// Build the complete API router.
pub fn build_router(
    store: StateStore,
    management: Arc<RolloutManagement>,
    events: BroadcastSink,
) -> Router {
    let state = ApiState {
        store,
        management,
        events,
    };

    let api_routes = Router::new()
        .route("/targets", get(handlers::list_targets).post(handlers::register_target))
        .route("/targets/{id}", get(handlers::get_target))
        .route("/targets/{id}/actions", get(handlers::list_target_actions))
        .route(
            "/distributions",
            get(handlers::list_distributions).post(handlers::create_distribution),
        )
        .route("/distributions/{id}/invalidate", post(handlers::invalidate_distribution))
        .route("/actions/{id}", get(handlers::get_action))
        .route("/actions/{id}/status", post(handlers::report_action_status))
        .route(
            "/rollouts",
            get(rollout_handlers::list_rollouts).post(rollout_handlers::create_rollout),
        )
        .route(
            "/rollouts/{id}",
            get(rollout_handlers::get_rollout_status).delete(rollout_handlers::delete_rollout),
        )
        .route("/rollouts/{id}/start", post(rollout_handlers::start_rollout))
        .route("/rollouts/{id}/pause", post(rollout_handlers::pause_rollout))
        .route("/rollouts/{id}/resume", post(rollout_handlers::resume_rollout))
        .route("/rollouts/{id}/stop", post(rollout_handlers::stop_rollout))
        .route(
            "/rollouts/{id}/trigger-next-group",
            post(rollout_handlers::trigger_next_group),
        )
        .route("/rollouts/{id}/groups", get(rollout_handlers::list_groups))
        .route("/groups/{id}", get(rollout_handlers::get_group_status))
        .route("/groups/{id}/targets", get(rollout_handlers::list_group_targets))
        .route("/events", get(rollout_handlers::watch_events))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
