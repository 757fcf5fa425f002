//! Status aggregation over a rollout's or a group's actions.

use fleetgrid_state::{
    ActionStatus, RolloutGroup, RolloutId, StateStore, StatusHistogram,
};
use serde::{Deserialize, Serialize};

use crate::error::{RolloutError, RolloutResult};

/// Target counts by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalTargetCountStatus {
    pub total: u64,
    pub scheduled: u64,
    /// Running, downloading, retrieved, warning or being cancelled.
    pub running: u64,
    pub error: u64,
    pub finished: u64,
    pub cancelled: u64,
    /// Targets without an action yet.
    pub not_started: u64,
}

impl TotalTargetCountStatus {
    pub fn from_histogram(total: u64, histogram: &StatusHistogram) -> Self {
        let mut counts = Self {
            total,
            ..Self::default()
        };
        let mut with_action = 0u64;
        for (status, n) in histogram {
            with_action += n;
            match status {
                ActionStatus::Scheduled => counts.scheduled += n,
                ActionStatus::Running
                | ActionStatus::Warning
                | ActionStatus::Download
                | ActionStatus::Retrieved
                | ActionStatus::Canceling => counts.running += n,
                ActionStatus::Error => counts.error += n,
                ActionStatus::Finished => counts.finished += n,
                ActionStatus::Canceled => counts.cancelled += n,
            }
        }
        counts.not_started = total.saturating_sub(with_action);
        counts
    }

    /// Share of finished targets, 0.0 to 100.0.
    pub fn finished_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.finished as f64 * 100.0 / self.total as f64
    }

    /// Every target has an action and every action is terminal.
    pub fn is_exhausted(&self) -> bool {
        self.total > 0 && self.not_started == 0 && self.scheduled == 0 && self.running == 0
    }
}

/// Computes [`TotalTargetCountStatus`] with one index scan per call.
#[derive(Clone)]
pub struct StatusAggregator {
    store: StateStore,
}

impl StatusAggregator {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn group_counts(&self, group: &RolloutGroup) -> RolloutResult<TotalTargetCountStatus> {
        let histogram = self.store.group_status_histogram(group.id)?;
        Ok(TotalTargetCountStatus::from_histogram(
            group.total_targets,
            &histogram,
        ))
    }

    pub fn rollout_counts(&self, rollout_id: RolloutId) -> RolloutResult<TotalTargetCountStatus> {
        let rollout = self
            .store
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {rollout_id}")))?;
        let histogram = self.store.rollout_status_histogram(rollout_id)?;
        Ok(TotalTargetCountStatus::from_histogram(
            rollout.total_targets,
            &histogram,
        ))
    }
}
