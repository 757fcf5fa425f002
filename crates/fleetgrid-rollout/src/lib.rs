//! FleetGrid rollout engine — phased distribution of software updates.
//!
//! A rollout assigns one distribution to the targets matching a filter,
//! split into ordered groups. Groups run one after the other; a group is
//! done when its success threshold is met, and an error threshold can pause
//! the whole rollout.
//!
//! # Components
//!
//! - **`management`** — Operator commands and status queries
//! - **`controller`** — Rollout state machine, driven by the scheduler
//! - **`group`** — Group state machine and threshold checks
//! - **`builder`** — Partitioning the target population into groups
//! - **`assigner`** — Creating actions for a starting group
//! - **`aggregator`** — Target counts by action status
//! - **`access`** — Permission checks for operator calls
//! - **`events`** — Notifications about rollout progress

pub mod access;
pub mod aggregator;
pub mod assigner;
pub mod builder;
pub mod controller;
pub mod error;
pub mod events;
pub mod group;
pub mod management;
pub mod strategy;
pub mod threshold;

#[cfg(test)]
mod scenario_tests;

pub use access::{AccessPolicy, AllowAll, Caller, Operation, Permission, PermissionPolicy};
pub use aggregator::{StatusAggregator, TotalTargetCountStatus};
pub use controller::{ENGINE_ACTOR, ProcessOutcome, RolloutController};
pub use error::{RolloutError, RolloutResult};
pub use events::{BroadcastSink, EventSink, LogSink, MultiSink, RolloutEvent};
pub use management::{GroupStatusView, RolloutManagement, RolloutStatusView};
pub use strategy::{CreateRolloutRequest, GroupDefinition, GroupingSpec};
pub use threshold::ThresholdEvaluator;
