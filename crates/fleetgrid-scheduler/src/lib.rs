//! fleetgrid-scheduler — drives rollouts forward in the background.
//!
//! Every tick lists the rollouts in an active status and hands each one to
//! the [`RolloutController`](fleetgrid_rollout::RolloutController) on a
//! blocking worker, at most `max_parallel` at a time.
//!
//! # Architecture
//!
//! ```text
//! RolloutScheduler
//!   ├── StateStore (list active rollouts, per-rollout leases)
//!   └── per rollout, on a blocking worker
//!       ├── try_acquire_lease (skip if another worker holds it)
//!       ├── RolloutController::process
//!       └── release_lease
//! ```

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{RolloutScheduler, TickReport};
