//! Group transition engine — per-group state machine.
//!
//! `SCHEDULED → RUNNING → FINISHED`, or `RUNNING → ERROR` when the error
//! condition trips and the configured policy marks the group as failed.

use fleetgrid_core::{EngineConfig, NoneErrorAction};
use fleetgrid_state::{
    ErrorAction, GroupId, GroupStatus, RolloutGroup, RolloutId, RolloutStatus, StateStore,
};
use tracing::debug;

use crate::aggregator::{StatusAggregator, TotalTargetCountStatus};
use crate::assigner::{ActionAssigner, AssignOutcome};
use crate::error::{RolloutError, RolloutResult};
use crate::threshold::ThresholdEvaluator;

/// Result of starting a `SCHEDULED` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Actions created, group is `RUNNING`.
    Started { actions: usize, superseded: usize },
    /// The group has no targets and went straight to `FINISHED`.
    Empty,
    /// The group was not `SCHEDULED` any more.
    AlreadyStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupVerdict {
    /// Success condition met or every action terminal.
    Finished,
    /// Error condition tripped with a policy that fails the group.
    Error { errors: u64 },
    /// Error condition tripped with error action `pause`.
    PauseRollout { errors: u64 },
    /// Nothing to do this tick.
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupEvaluation {
    pub verdict: GroupVerdict,
    pub counts: TotalTargetCountStatus,
    /// The error condition tripped with a purely informational policy.
    pub informational_error: bool,
}

#[derive(Clone)]
pub struct GroupEngine {
    store: StateStore,
    aggregator: StatusAggregator,
    evaluator: ThresholdEvaluator,
    assigner: ActionAssigner,
    none_error_action: NoneErrorAction,
}

impl GroupEngine {
    pub fn new(store: StateStore, config: &EngineConfig) -> Self {
        Self {
            aggregator: StatusAggregator::new(store.clone()),
            evaluator: ThresholdEvaluator::new(config.percent_rounding),
            assigner: ActionAssigner,
            none_error_action: config.none_error_action,
            store,
        }
    }

    /// Start a `SCHEDULED` group: assign its actions and move it to `RUNNING`
    /// in one transaction. A group without targets moves to `FINISHED`
    /// without any assignment.
    pub fn start(&self, rollout_id: RolloutId, group_id: GroupId) -> RolloutResult<GroupStart> {
        self.store.write(|txn| {
            let rollout = txn.require_rollout(rollout_id)?;
            if !matches!(
                rollout.status,
                RolloutStatus::Starting | RolloutStatus::Running
            ) {
                return Err(RolloutError::StateConflict(format!(
                    "rollout {rollout_id} is {:?}, cannot start groups",
                    rollout.status
                )));
            }
            let group = txn.require_group(group_id)?;
            if group.status != GroupStatus::Scheduled {
                return Ok(GroupStart::AlreadyStarted);
            }
            if group.total_targets == 0 {
                txn.transition_group(group_id, GroupStatus::Scheduled, GroupStatus::Finished)?;
                return Ok(GroupStart::Empty);
            }
            let start = match self.assigner.assign_in(txn, &rollout, &group)? {
                AssignOutcome::Created {
                    actions,
                    superseded,
                } => GroupStart::Started {
                    actions,
                    superseded,
                },
                AssignOutcome::AlreadyAssigned => GroupStart::AlreadyStarted,
            };
            txn.transition_group(group_id, GroupStatus::Scheduled, GroupStatus::Running)?;
            Ok(start)
        })
    }

    /// Decide what a `RUNNING` group should do next. Read-only.
    pub fn evaluate(&self, group: &RolloutGroup) -> RolloutResult<GroupEvaluation> {
        let counts = self.aggregator.group_counts(group)?;
        let total = counts.total;
        let mut evaluation = GroupEvaluation {
            verdict: GroupVerdict::Continue,
            counts,
            informational_error: false,
        };
        if total == 0 {
            evaluation.verdict = GroupVerdict::Finished;
            return Ok(evaluation);
        }

        let conditions = &group.conditions;
        if let Some(error) = &conditions.error
            && !group.error_action_taken
            && self.evaluator.evaluate(error, evaluation.counts.error, total)
        {
            let errors = evaluation.counts.error;
            match (conditions.error_action, self.none_error_action) {
                (ErrorAction::Pause, _) => {
                    evaluation.verdict = GroupVerdict::PauseRollout { errors };
                    return Ok(evaluation);
                }
                (ErrorAction::None, NoneErrorAction::MarkGroupError) => {
                    evaluation.verdict = GroupVerdict::Error { errors };
                    return Ok(evaluation);
                }
                (ErrorAction::None, NoneErrorAction::Informational) => {
                    evaluation.informational_error = true;
                }
            }
        }

        if self
            .evaluator
            .evaluate(&conditions.success, evaluation.counts.finished, total)
            || evaluation.counts.is_exhausted()
        {
            evaluation.verdict = GroupVerdict::Finished;
        }
        debug!(
            group = group.id,
            verdict = ?evaluation.verdict,
            finished = evaluation.counts.finished,
            error = evaluation.counts.error,
            total,
            "group evaluated"
        );
        Ok(evaluation)
    }

    /// Move a `RUNNING` group to `FINISHED` or `ERROR`, guarded on the
    /// rollout still being `RUNNING`.
    pub fn complete(
        &self,
        rollout_id: RolloutId,
        group_id: GroupId,
        to: GroupStatus,
    ) -> RolloutResult<RolloutGroup> {
        self.store.write(|txn| {
            let rollout = txn.require_rollout(rollout_id)?;
            if rollout.status != RolloutStatus::Running {
                return Err(RolloutError::StateConflict(format!(
                    "rollout {rollout_id} is {:?}, cannot complete group {group_id}",
                    rollout.status
                )));
            }
            Ok(txn.transition_group(group_id, GroupStatus::Running, to)?)
        })
    }

    /// Remember that the error action of a group was applied, guarded on
    /// the rollout still being `RUNNING`.
    pub fn mark_error_action_taken(
        &self,
        rollout_id: RolloutId,
        group_id: GroupId,
    ) -> RolloutResult<()> {
        self.store.write(|txn| {
            let rollout = txn.require_rollout(rollout_id)?;
            if rollout.status != RolloutStatus::Running {
                return Err(RolloutError::StateConflict(format!(
                    "rollout {rollout_id} is {:?}, cannot flag group {group_id}",
                    rollout.status
                )));
            }
            let mut group = txn.require_group(group_id)?;
            group.error_action_taken = true;
            txn.put_group(&group)?;
            Ok::<_, RolloutError>(())
        })
    }
}
