//! Operator-facing rollout management.
//!
//! Every entry point authorizes the caller first and validates that the
//! rollout is in a legal source state inside the write transaction.

use std::sync::Arc;

use fleetgrid_core::{EngineConfig, TargetFilter};
use fleetgrid_state::{
    ActionScope, ActionSelector, ActionStatus, ActionType, GroupId, GroupStatus, Rollout,
    RolloutGroup, RolloutId, RolloutStatus, StateStore, StoreTxn, TargetId, epoch_millis,
};
use serde::Serialize;
use tracing::info;

use crate::access::{AccessPolicy, Caller, Operation};
use crate::aggregator::{StatusAggregator, TotalTargetCountStatus};
use crate::assigner::{ActionAssigner, AssignOutcome};
use crate::builder::plan_partition;
use crate::error::{RolloutError, RolloutResult};
use crate::events::{EventSink, RolloutEvent};
use crate::strategy::{CreateRolloutRequest, GroupingSpec};

/// Rollout with its overall and per-group target counts.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutStatusView {
    pub rollout: Rollout,
    pub counts: TotalTargetCountStatus,
    pub groups: Vec<GroupStatusView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatusView {
    pub group: RolloutGroup,
    pub counts: TotalTargetCountStatus,
    pub finished_percent: f64,
}

#[derive(Clone)]
pub struct RolloutManagement {
    store: StateStore,
    aggregator: StatusAggregator,
    policy: Arc<dyn AccessPolicy>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl RolloutManagement {
    pub fn new(
        store: StateStore,
        config: EngineConfig,
        policy: Arc<dyn AccessPolicy>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            aggregator: StatusAggregator::new(store.clone()),
            store,
            policy,
            events,
            config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Validate a rollout definition and persist it in `CREATING`.
    ///
    /// Groups are stored unbuilt; the scheduler fills them. The population is
    /// dry-run partitioned here so that an empty population or a group list
    /// that misses matching targets is rejected synchronously.
    pub fn create_rollout(
        &self,
        caller: &Caller,
        request: CreateRolloutRequest,
    ) -> RolloutResult<Rollout> {
        self.policy.authorize(caller, Operation::Create, None)?;

        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(RolloutError::InvalidConfig("rollout name is empty".into()));
        }
        let base = TargetFilter::parse(&request.target_filter)?;
        if request.action_type == ActionType::TimeForced && request.forced_time.is_none() {
            return Err(RolloutError::InvalidConfig(
                "time_forced rollouts need a forced_time".into(),
            ));
        }
        let groups = request
            .grouping
            .resolve(&request.default_conditions, self.config.max_groups)?;
        crate::strategy::validate_conditions(&request.default_conditions)
            .map_err(RolloutError::InvalidConfig)?;

        let distribution = self
            .store
            .get_distribution(request.distribution_id)?
            .ok_or_else(|| {
                RolloutError::NotFound(format!("distribution {}", request.distribution_id))
            })?;
        if !distribution.valid {
            return Err(RolloutError::InvalidConfig(format!(
                "distribution {} is invalidated",
                distribution.id
            )));
        }

        let created_at = epoch_millis();
        let population = self.store.query_targets(&base, Some(created_at))?;
        if population.is_empty() {
            return Err(RolloutError::InvalidConfig(format!(
                "filter {base} matches no targets"
            )));
        }
        let plan = plan_partition(&population, &base, &groups)?;
        if matches!(request.grouping, GroupingSpec::Explicit { .. }) && plan.unassigned > 0 {
            return Err(RolloutError::InvalidConfig(format!(
                "{} matching targets are not covered by any group",
                plan.unassigned
            )));
        }

        let rollout = self.store.write(|txn| {
            if txn.find_rollout_by_name(&name)?.is_some() {
                return Err(RolloutError::AlreadyExists(format!("rollout {name}")));
            }
            let rollout_id = txn.next_id("rollout")?;
            let mut group_ids = Vec::with_capacity(groups.len());
            let mut parent = None;
            for (position, def) in groups.iter().enumerate() {
                let id = txn.next_id("group")?;
                txn.put_group(&RolloutGroup {
                    id,
                    rollout_id,
                    name: def.name.clone(),
                    description: def.description.clone(),
                    position: position as u32,
                    parent_id: parent,
                    status: GroupStatus::Creating,
                    target_filter: def.target_filter.clone(),
                    target_percentage: def.target_percentage,
                    conditions: def.conditions,
                    error_action_taken: false,
                    total_targets: 0,
                    created_at,
                    updated_at: created_at,
                })?;
                group_ids.push(id);
                parent = Some(id);
            }
            let rollout = Rollout {
                id: rollout_id,
                name: name.clone(),
                description: request.description.clone(),
                distribution_id: distribution.id,
                target_filter: base.as_str().to_string(),
                action_type: request.action_type,
                forced_time: request.forced_time,
                status: RolloutStatus::Creating,
                group_ids,
                default_conditions: request.default_conditions,
                total_targets: 0,
                deleted: false,
                created_by: caller.name.clone(),
                updated_by: caller.name.clone(),
                created_at,
                updated_at: created_at,
            };
            txn.put_rollout(&rollout)?;
            Ok(rollout)
        })?;

        info!(
            rollout = rollout.id,
            name = %rollout.name,
            groups = rollout.group_ids.len(),
            targets = plan.assigned(),
            by = %caller.name,
            "rollout created"
        );
        self.events.publish(RolloutEvent::Created {
            rollout: rollout.id,
            name: rollout.name.clone(),
            groups: rollout.group_ids.len(),
        });
        Ok(rollout)
    }

    /// `READY → STARTING`. The scheduler then starts the first group.
    pub fn start_rollout(&self, caller: &Caller, id: RolloutId) -> RolloutResult<Rollout> {
        self.policy.authorize(caller, Operation::Start, Some(id))?;
        let rollout = self.store.write(|txn| {
            let current = txn.require_rollout(id)?;
            let distribution = txn.get_distribution(current.distribution_id)?;
            if !distribution.is_some_and(|d| d.valid) {
                return Err(RolloutError::InvalidConfig(format!(
                    "distribution {} is invalidated",
                    current.distribution_id
                )));
            }
            Ok(txn.transition_rollout(
                id,
                &[RolloutStatus::Ready],
                RolloutStatus::Starting,
                &caller.name,
            )?)
        })?;
        self.changed(caller, id, RolloutStatus::Ready, RolloutStatus::Starting);
        Ok(rollout)
    }

    /// `RUNNING → PAUSED`.
    pub fn pause_rollout(&self, caller: &Caller, id: RolloutId) -> RolloutResult<Rollout> {
        self.policy.authorize(caller, Operation::Pause, Some(id))?;
        let rollout = self.store.write(|txn| {
            txn.transition_rollout(id, &[RolloutStatus::Running], RolloutStatus::Paused, &caller.name)
        })?;
        self.changed(caller, id, RolloutStatus::Running, RolloutStatus::Paused);
        Ok(rollout)
    }

    /// `PAUSED → RUNNING`.
    pub fn resume_rollout(&self, caller: &Caller, id: RolloutId) -> RolloutResult<Rollout> {
        self.policy.authorize(caller, Operation::Resume, Some(id))?;
        let rollout = self.store.write(|txn| {
            txn.transition_rollout(id, &[RolloutStatus::Paused], RolloutStatus::Running, &caller.name)
        })?;
        self.changed(caller, id, RolloutStatus::Paused, RolloutStatus::Running);
        Ok(rollout)
    }

    /// Any non-terminal status `→ STOPPED`.
    ///
    /// In the same transaction, active non-terminal actions of the rollout
    /// become `CANCELING` (the device still has to confirm) and inactive
    /// non-terminal ones become `CANCELED`. Group statuses are kept.
    pub fn stop_rollout(&self, caller: &Caller, id: RolloutId) -> RolloutResult<Rollout> {
        self.policy.authorize(caller, Operation::Stop, Some(id))?;
        let message = format!("rollout stopped by {}", caller.name);
        let stopped = self
            .store
            .write(|txn| stop_in(txn, id, &STOPPABLE, &caller.name, &message))?;

        self.changed(caller, id, stopped.from, RolloutStatus::Stopped);
        self.events.publish(RolloutEvent::ActionsCancelled {
            rollout: id,
            count: stopped.cancelled,
        });
        Ok(stopped.rollout)
    }

    /// Finish the running group ahead of its success condition and start the
    /// next `SCHEDULED` group, in one transaction. Only for `RUNNING`
    /// rollouts with a group left to trigger. Returns the started group.
    pub fn trigger_next_group(&self, caller: &Caller, id: RolloutId) -> RolloutResult<RolloutGroup> {
        self.policy
            .authorize(caller, Operation::TriggerNextGroup, Some(id))?;
        let (finished, next, assigned) = self.store.write(|txn| {
            let rollout = txn.require_rollout(id)?;
            if rollout.deleted || rollout.status != RolloutStatus::Running {
                return Err(RolloutError::StateConflict(format!(
                    "rollout {id} is {:?}, not running",
                    rollout.status
                )));
            }
            let groups = txn.list_groups(id)?;
            let running = groups
                .iter()
                .find(|g| g.status == GroupStatus::Running)
                .ok_or_else(|| {
                    RolloutError::StateConflict(format!("rollout {id} has no running group"))
                })?;
            let next = groups
                .iter()
                .find(|g| g.position > running.position && g.status == GroupStatus::Scheduled)
                .ok_or_else(|| {
                    RolloutError::StateConflict(format!("rollout {id} has no group left to trigger"))
                })?;

            let finished =
                txn.transition_group(running.id, GroupStatus::Running, GroupStatus::Finished)?;
            if next.total_targets == 0 {
                let next =
                    txn.transition_group(next.id, GroupStatus::Scheduled, GroupStatus::Finished)?;
                return Ok((finished, next, None));
            }
            let assigned = ActionAssigner.assign_in(txn, &rollout, next)?;
            let next = txn.transition_group(next.id, GroupStatus::Scheduled, GroupStatus::Running)?;
            Ok((finished, next, Some(assigned)))
        })?;

        info!(
            rollout = id,
            finished = finished.id,
            next = next.id,
            by = %caller.name,
            "next group triggered"
        );
        self.events.publish(RolloutEvent::GroupStatusChanged {
            rollout: id,
            group: finished.id,
            from: GroupStatus::Running,
            to: GroupStatus::Finished,
        });
        if let Some(AssignOutcome::Created {
            actions,
            superseded,
        }) = assigned
        {
            self.events.publish(RolloutEvent::ActionsCreated {
                rollout: id,
                group: next.id,
                created: actions,
                superseded,
            });
        }
        self.events.publish(RolloutEvent::GroupStatusChanged {
            rollout: id,
            group: next.id,
            from: GroupStatus::Scheduled,
            to: next.status,
        });
        Ok(next)
    }

    /// Soft delete. Only terminal rollouts can be deleted.
    pub fn delete_rollout(&self, caller: &Caller, id: RolloutId) -> RolloutResult<()> {
        self.policy.authorize(caller, Operation::Delete, Some(id))?;
        self.store.write(|txn| {
            let mut rollout = txn.require_rollout(id)?;
            if rollout.deleted {
                return Err(RolloutError::NotFound(format!("rollout {id}")));
            }
            if !rollout.status.is_terminal() {
                return Err(RolloutError::StateConflict(format!(
                    "rollout {id} is {:?}; stop it before deleting",
                    rollout.status
                )));
            }
            rollout.deleted = true;
            rollout.updated_by = caller.name.clone();
            rollout.updated_at = epoch_millis();
            txn.put_rollout(&rollout)?;
            Ok(())
        })?;
        info!(rollout = id, by = %caller.name, "rollout deleted");
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_rollout(&self, caller: &Caller, id: RolloutId) -> RolloutResult<Rollout> {
        self.policy.authorize(caller, Operation::Read, Some(id))?;
        self.visible_rollout(id)
    }

    /// Check that the caller may watch rollout events.
    pub fn authorize_events(&self, caller: &Caller) -> RolloutResult<()> {
        self.policy.authorize(caller, Operation::Read, None)
    }

    pub fn list_rollouts(&self, caller: &Caller) -> RolloutResult<Vec<Rollout>> {
        self.policy.authorize(caller, Operation::Read, None)?;
        Ok(self.store.list_rollouts(false)?)
    }

    pub fn get_rollout_status(
        &self,
        caller: &Caller,
        id: RolloutId,
    ) -> RolloutResult<RolloutStatusView> {
        self.policy.authorize(caller, Operation::Read, Some(id))?;
        let rollout = self.visible_rollout(id)?;
        let counts = self.aggregator.rollout_counts(id)?;
        let groups = self.group_views(id)?;
        Ok(RolloutStatusView {
            rollout,
            counts,
            groups,
        })
    }

    pub fn list_group_status(
        &self,
        caller: &Caller,
        id: RolloutId,
    ) -> RolloutResult<Vec<GroupStatusView>> {
        self.policy.authorize(caller, Operation::Read, Some(id))?;
        self.visible_rollout(id)?;
        self.group_views(id)
    }

    pub fn get_group_status(
        &self,
        caller: &Caller,
        group_id: GroupId,
    ) -> RolloutResult<GroupStatusView> {
        let group = self.visible_group(group_id)?;
        self.policy
            .authorize(caller, Operation::Read, Some(group.rollout_id))?;
        self.group_view(group)
    }

    pub fn list_group_targets(
        &self,
        caller: &Caller,
        group_id: GroupId,
        offset: usize,
        limit: usize,
    ) -> RolloutResult<Vec<TargetId>> {
        let group = self.visible_group(group_id)?;
        self.policy
            .authorize(caller, Operation::Read, Some(group.rollout_id))?;
        Ok(self.store.group_target_ids(group_id, offset, limit)?)
    }

    fn visible_rollout(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.store
            .get_rollout(id)?
            .filter(|r| !r.deleted)
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {id}")))
    }

    fn visible_group(&self, id: GroupId) -> RolloutResult<RolloutGroup> {
        let group = self
            .store
            .get_group(id)?
            .ok_or_else(|| RolloutError::NotFound(format!("group {id}")))?;
        self.visible_rollout(group.rollout_id)
            .map_err(|_| RolloutError::NotFound(format!("group {id}")))?;
        Ok(group)
    }

    fn group_views(&self, id: RolloutId) -> RolloutResult<Vec<GroupStatusView>> {
        self.store
            .list_groups(id)?
            .into_iter()
            .map(|g| self.group_view(g))
            .collect()
    }

    fn group_view(&self, group: RolloutGroup) -> RolloutResult<GroupStatusView> {
        let counts = self.aggregator.group_counts(&group)?;
        Ok(GroupStatusView {
            finished_percent: counts.finished_percent(),
            group,
            counts,
        })
    }

    fn changed(&self, caller: &Caller, rollout: RolloutId, from: RolloutStatus, to: RolloutStatus) {
        info!(rollout, ?from, ?to, by = %caller.name, "rollout status changed");
        self.events
            .publish(RolloutEvent::StatusChanged { rollout, from, to });
    }
}

/// Statuses an operator can stop a rollout from.
pub(crate) const STOPPABLE: [RolloutStatus; 5] = [
    RolloutStatus::Creating,
    RolloutStatus::Ready,
    RolloutStatus::Starting,
    RolloutStatus::Running,
    RolloutStatus::Paused,
];

pub(crate) struct Stopped {
    pub from: RolloutStatus,
    pub rollout: Rollout,
    pub cancelled: usize,
}

/// Move the rollout to `STOPPED` inside the caller's transaction and cancel
/// its open actions. Fails with a conflict unless the rollout is in `from`.
pub(crate) fn stop_in(
    txn: &StoreTxn,
    id: RolloutId,
    from: &[RolloutStatus],
    actor: &str,
    message: &str,
) -> RolloutResult<Stopped> {
    let previous = txn.require_rollout(id)?.status;
    let rollout = txn.transition_rollout(id, from, RolloutStatus::Stopped, actor)?;
    let cancel_active: Vec<ActionStatus> = ActionStatus::NON_TERMINAL
        .into_iter()
        .filter(|s| *s != ActionStatus::Canceling)
        .collect();
    let active = txn.switch_actions(
        &ActionSelector::new(ActionScope::Rollout(id), &cancel_active).active(true),
        ActionStatus::Canceling,
        false,
        Some(message),
    )?;
    let inactive = txn.switch_actions(
        &ActionSelector::new(ActionScope::Rollout(id), &ActionStatus::NON_TERMINAL).active(false),
        ActionStatus::Canceled,
        true,
        Some(message),
    )?;
    Ok(Stopped {
        from: previous,
        rollout,
        cancelled: active.len() + inactive.len(),
    })
}
