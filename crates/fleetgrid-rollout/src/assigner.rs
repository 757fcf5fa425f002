//! Action assignment for a group that is about to run.

use fleetgrid_state::{
    ActionScope, ActionSelector, ActionStatus, NewAction, Rollout, RolloutGroup, StoreTxn,
};

use crate::error::RolloutResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    /// Actions were created for every member target.
    Created { actions: usize, superseded: usize },
    /// The group already has actions; nothing was written.
    AlreadyAssigned,
}

/// Creates one active `RUNNING` action per member target of a group.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionAssigner;

impl ActionAssigner {
    /// Assign the group's targets inside the caller's transaction.
    ///
    /// Idempotent: if any action of the group exists, nothing is created.
    /// Any other non-terminal action of a member target is cancelled and
    /// deactivated first, so a target never has two active actions.
    pub fn assign_in(
        &self,
        txn: &StoreTxn,
        rollout: &Rollout,
        group: &RolloutGroup,
    ) -> RolloutResult<AssignOutcome> {
        if txn.group_has_actions(group.id)? {
            return Ok(AssignOutcome::AlreadyAssigned);
        }

        let supersede_msg = format!("superseded by rollout {} group {}", rollout.id, group.id);
        let assign_msg = format!("assigned by rollout {} group {}", rollout.id, group.id);
        let targets = txn.group_target_ids(group.id)?;
        let mut superseded = 0;
        for target in &targets {
            let selector =
                ActionSelector::new(ActionScope::Target(target.clone()), &ActionStatus::NON_TERMINAL)
                    .excluding_group(group.id);
            superseded += txn
                .switch_actions(
                    &selector,
                    ActionStatus::Canceled,
                    true,
                    Some(supersede_msg.as_str()),
                )?
                .len();

            txn.insert_action(
                NewAction {
                    target_id: target.clone(),
                    distribution_id: rollout.distribution_id,
                    rollout_id: Some(rollout.id),
                    group_id: Some(group.id),
                    status: ActionStatus::Running,
                    active: true,
                    action_type: rollout.action_type,
                    forced_time: rollout.forced_time,
                },
                Some(assign_msg.as_str()),
            )?;
        }

        Ok(AssignOutcome::Created {
            actions: targets.len(),
            superseded,
        })
    }
}
