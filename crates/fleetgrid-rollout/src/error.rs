//! Error types for the rollout engine.

use fleetgrid_core::FilterError;
use fleetgrid_state::StateError;
use thiserror::Error;

pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The record is not in a state that permits the requested transition.
    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid target filter: {0}")]
    Filter(#[from] FilterError),

    #[error("state store: {0}")]
    State(StateError),
}

impl RolloutError {
    /// Whether retrying the same step later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RolloutError::State(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<StateError> for RolloutError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => RolloutError::NotFound(what),
            StateError::Conflict(msg) => RolloutError::StateConflict(msg),
            StateError::InvalidInput(msg) => RolloutError::InvalidConfig(msg),
            other => RolloutError::State(other),
        }
    }
}
