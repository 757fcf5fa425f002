//! Scheduler error types.

use thiserror::Error;

/// Errors that abort a whole scheduler tick.
///
/// Failures of a single rollout are not errors of the tick; they are logged
/// and counted in the [`TickReport`](crate::TickReport).
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),

    #[error("worker pool closed: {0}")]
    WorkerPool(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
