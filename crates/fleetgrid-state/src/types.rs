//! Domain types for the FleetGrid state store.
//!
//! These types represent the persisted state of targets, distributions,
//! rollouts, rollout groups and actions. All types are serializable to/from
//! JSON for storage in redb tables.

use fleetgrid_core::FilterSubject;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Controller id of a target (device).
pub type TargetId = String;
pub type DistributionId = u64;
pub type RolloutId = u64;
pub type GroupId = u64;
pub type ActionId = u64;

/// Action counts keyed by action status.
pub type StatusHistogram = BTreeMap<ActionStatus, u64>;

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Target ─────────────────────────────────────────────────────────

/// A managed device that can execute actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub controller_id: TargetId,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Unix timestamp (milliseconds) of registration.
    pub created_at: u64,
}

impl Target {
    /// Controller ids are restricted to `[A-Za-z0-9_.:-]+`.
    pub fn is_valid_controller_id(id: &str) -> bool {
        !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
    }
}

impl FilterSubject for Target {
    fn controller_id(&self) -> &str {
        &self.controller_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    fn created_at(&self) -> u64 {
        self.created_at
    }
}

// ── Distribution ───────────────────────────────────────────────────

/// A software bundle that can be rolled out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Distribution {
    pub id: DistributionId,
    pub name: String,
    pub version: String,
    /// Software module references, never empty.
    pub modules: Vec<String>,
    /// An invalidated distribution can no longer be rolled out.
    pub valid: bool,
    pub created_at: u64,
}

// ── Rollout ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Creating,
    Ready,
    Starting,
    Running,
    Paused,
    Finished,
    Stopped,
    ErrorCreating,
    ErrorStarting,
}

impl RolloutStatus {
    /// Statuses the scheduler has to drive.
    pub const ACTIVE: [RolloutStatus; 4] = [
        RolloutStatus::Creating,
        RolloutStatus::Ready,
        RolloutStatus::Starting,
        RolloutStatus::Running,
    ];

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RolloutStatus::Finished
                | RolloutStatus::Stopped
                | RolloutStatus::ErrorCreating
                | RolloutStatus::ErrorStarting
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    #[default]
    Forced,
    Soft,
    TimeForced,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub name: String,
    pub description: Option<String>,
    pub distribution_id: DistributionId,
    /// Target filter expression selecting the population.
    pub target_filter: String,
    pub action_type: ActionType,
    /// Epoch milliseconds, set for `time_forced` rollouts.
    pub forced_time: Option<u64>,
    pub status: RolloutStatus,
    /// Groups in execution order.
    pub group_ids: Vec<GroupId>,
    pub default_conditions: GroupConditions,
    /// Number of targets assigned to groups, known once the build finished.
    pub total_targets: u64,
    pub deleted: bool,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Rollout groups ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Membership not yet built.
    Creating,
    Scheduled,
    Running,
    Finished,
    Error,
}

impl GroupStatus {
    pub fn is_done(self) -> bool {
        matches!(self, GroupStatus::Finished | GroupStatus::Error)
    }
}

/// A success or error threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Threshold {
    /// Percentage (0..=100) of the group's total target count.
    Percentage(u32),
    /// Absolute number of targets.
    Count(u64),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    #[default]
    Pause,
    None,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupConditions {
    pub success: Threshold,
    pub error: Option<Threshold>,
    #[serde(default)]
    pub error_action: ErrorAction,
}

impl Default for GroupConditions {
    fn default() -> Self {
        Self {
            success: Threshold::Percentage(100),
            error: None,
            error_action: ErrorAction::Pause,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutGroup {
    pub id: GroupId,
    pub rollout_id: RolloutId,
    pub name: String,
    pub description: Option<String>,
    /// 0-based execution order.
    pub position: u32,
    /// The preceding group, if any.
    pub parent_id: Option<GroupId>,
    pub status: GroupStatus,
    /// Refinement applied on top of the rollout filter.
    pub target_filter: Option<String>,
    /// Share of the still unassigned matching targets to take, in (0, 100].
    pub target_percentage: f64,
    pub conditions: GroupConditions,
    /// Set once the error action of a tripped error condition was applied,
    /// so a resumed rollout is not paused again for the same errors.
    #[serde(default)]
    pub error_action_taken: bool,
    pub total_targets: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Actions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Running,
    Scheduled,
    Canceling,
    Canceled,
    Error,
    Finished,
    Warning,
    Download,
    Retrieved,
}

impl ActionStatus {
    pub const NON_TERMINAL: [ActionStatus; 6] = [
        ActionStatus::Running,
        ActionStatus::Scheduled,
        ActionStatus::Canceling,
        ActionStatus::Warning,
        ActionStatus::Download,
        ActionStatus::Retrieved,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionStatus::Canceled | ActionStatus::Error | ActionStatus::Finished
        )
    }
}

/// One unit of assigned work on one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub target_id: TargetId,
    pub distribution_id: DistributionId,
    /// `None` for actions not created by a rollout.
    pub rollout_id: Option<RolloutId>,
    pub group_id: Option<GroupId>,
    pub status: ActionStatus,
    /// At most one active action exists per target.
    pub active: bool,
    pub action_type: ActionType,
    pub forced_time: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Fields of an action that is about to be inserted.
#[derive(Debug, Clone)]
pub struct NewAction {
    pub target_id: TargetId,
    pub distribution_id: DistributionId,
    pub rollout_id: Option<RolloutId>,
    pub group_id: Option<GroupId>,
    pub status: ActionStatus,
    pub active: bool,
    pub action_type: ActionType,
    pub forced_time: Option<u64>,
}

/// Append-only history entry of an action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStatusEntry {
    pub action_id: ActionId,
    pub seq: u32,
    pub status: ActionStatus,
    pub message: Option<String>,
    pub occurred_at: u64,
}

// ── Leases ─────────────────────────────────────────────────────────

/// Per-rollout mutual exclusion record held by one scheduler worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub rollout_id: RolloutId,
    pub owner: String,
    pub expires_at_ms: u64,
}
