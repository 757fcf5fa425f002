//! Rollout controller — drives the rollout state machine.
//!
//! `CREATING → READY → STARTING → RUNNING → FINISHED`, with `RUNNING ⇄
//! PAUSED` and the terminal `ERROR_CREATING`, `ERROR_STARTING` and
//! `STOPPED`. A running rollout that fails deterministically is stopped. The controller is level-triggered: every call to
//! [`RolloutController::process`] re-reads the persisted state and takes the
//! next step, so a crash at any point is repaired by the next call.

use std::sync::Arc;

use fleetgrid_core::EngineConfig;
use fleetgrid_state::{
    GroupId, GroupStatus, Rollout, RolloutGroup, RolloutId, RolloutStatus, StateStore,
};
use tracing::{debug, error, info, warn};

use crate::builder::GroupBuilder;
use crate::error::{RolloutError, RolloutResult};
use crate::events::{EventSink, RolloutEvent};
use crate::group::{GroupEngine, GroupStart, GroupVerdict};
use crate::management::stop_in;

/// Actor recorded on status changes made by the engine.
pub const ENGINE_ACTOR: &str = "system";

/// What one [`RolloutController::process`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing changed.
    Idle,
    /// At least one rollout or group transition was committed.
    Advanced,
}

#[derive(Clone)]
pub struct RolloutController {
    store: StateStore,
    groups: GroupEngine,
    builder: GroupBuilder,
    events: Arc<dyn EventSink>,
}

impl RolloutController {
    pub fn new(store: StateStore, config: &EngineConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            groups: GroupEngine::new(store.clone(), config),
            builder: GroupBuilder::new(store.clone()),
            store,
            events,
        }
    }

    /// Take the next step for one rollout.
    ///
    /// Must not run concurrently for the same rollout; the scheduler holds the
    /// rollout's lease around this call. A transition that lost a race with
    /// an operator command is not an error. Deterministic failures while
    /// creating or starting move the rollout to its terminal error status;
    /// transient store failures are returned for a retry on the next tick.
    pub fn process(&self, rollout_id: RolloutId) -> RolloutResult<ProcessOutcome> {
        let rollout = self
            .store
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {rollout_id}")))?;
        if rollout.deleted {
            return Ok(ProcessOutcome::Idle);
        }

        let result = match rollout.status {
            RolloutStatus::Creating => self.handle_creating(&rollout),
            RolloutStatus::Starting => self.handle_starting(&rollout),
            RolloutStatus::Running => self.handle_running(&rollout),
            _ => Ok(ProcessOutcome::Idle),
        };

        match result {
            Err(RolloutError::StateConflict(msg)) => {
                debug!(rollout = rollout_id, %msg, "rollout changed concurrently, step skipped");
                Ok(ProcessOutcome::Idle)
            }
            Err(e) if !e.is_transient() => self.fail(&rollout, e),
            other => other,
        }
    }

    // ── CREATING ───────────────────────────────────────────────────

    fn handle_creating(&self, rollout: &Rollout) -> RolloutResult<ProcessOutcome> {
        for group in self.store.list_groups(rollout.id)? {
            if group.status == GroupStatus::Creating {
                self.builder.fill_group(rollout, &group)?;
            }
        }

        let ready = self.store.write(|txn| {
            let groups = txn.list_groups(rollout.id)?;
            if let Some(g) = groups.iter().find(|g| g.status == GroupStatus::Creating) {
                return Err(RolloutError::StateConflict(format!(
                    "group {} not built yet",
                    g.id
                )));
            }
            let total: u64 = groups.iter().map(|g| g.total_targets).sum();
            if total == 0 {
                return Err(RolloutError::InvalidConfig(
                    "target population vanished while building groups".into(),
                ));
            }
            let mut ready =
                txn.transition_rollout(rollout.id, &[RolloutStatus::Creating], RolloutStatus::Ready, ENGINE_ACTOR)?;
            ready.total_targets = total;
            txn.put_rollout(&ready)?;
            Ok(ready)
        })?;

        info!(
            rollout = rollout.id,
            targets = ready.total_targets,
            groups = ready.group_ids.len(),
            "rollout groups built"
        );
        self.status_changed(rollout.id, RolloutStatus::Creating, RolloutStatus::Ready);
        Ok(ProcessOutcome::Advanced)
    }

    // ── STARTING ───────────────────────────────────────────────────

    fn handle_starting(&self, rollout: &Rollout) -> RolloutResult<ProcessOutcome> {
        let distribution = self
            .store
            .get_distribution(rollout.distribution_id)?
            .ok_or_else(|| {
                RolloutError::InvalidConfig(format!(
                    "distribution {} does not exist",
                    rollout.distribution_id
                ))
            })?;
        if !distribution.valid {
            return Err(RolloutError::InvalidConfig(format!(
                "distribution {} was invalidated",
                distribution.id
            )));
        }

        let groups = self.store.list_groups(rollout.id)?;
        let first = groups
            .first()
            .ok_or_else(|| RolloutError::InvalidConfig(format!("rollout {} has no groups", rollout.id)))?;
        if first.status == GroupStatus::Scheduled {
            self.start_group(rollout.id, first)?;
        }

        self.store.write(|txn| {
            txn.transition_rollout(
                rollout.id,
                &[RolloutStatus::Starting],
                RolloutStatus::Running,
                ENGINE_ACTOR,
            )
        })?;
        self.status_changed(rollout.id, RolloutStatus::Starting, RolloutStatus::Running);
        Ok(ProcessOutcome::Advanced)
    }

    // ── RUNNING ────────────────────────────────────────────────────

    fn handle_running(&self, rollout: &Rollout) -> RolloutResult<ProcessOutcome> {
        let mut outcome = ProcessOutcome::Idle;
        // each pass either returns or moves one group forward
        for _ in 0..=rollout.group_ids.len() {
            let groups = self.store.list_groups(rollout.id)?;
            let Some(current) = groups.into_iter().find(|g| !g.status.is_done()) else {
                self.store.write(|txn| {
                    txn.transition_rollout(
                        rollout.id,
                        &[RolloutStatus::Running],
                        RolloutStatus::Finished,
                        ENGINE_ACTOR,
                    )
                })?;
                info!(rollout = rollout.id, "rollout finished");
                self.status_changed(rollout.id, RolloutStatus::Running, RolloutStatus::Finished);
                return Ok(ProcessOutcome::Advanced);
            };

            match current.status {
                GroupStatus::Scheduled => {
                    let start = self.start_group(rollout.id, &current)?;
                    if start != GroupStart::Empty {
                        return Ok(ProcessOutcome::Advanced);
                    }
                    outcome = ProcessOutcome::Advanced;
                }
                GroupStatus::Running => match self.evaluate_group(rollout.id, &current)? {
                    Some(_) => outcome = ProcessOutcome::Advanced,
                    None => return Ok(outcome),
                },
                other => {
                    return Err(RolloutError::InvalidConfig(format!(
                        "group {} of running rollout {} is {other:?}",
                        current.id, rollout.id
                    )));
                }
            }
        }
        Ok(outcome)
    }

    /// Evaluate the running group. Returns the new group status if the group
    /// completed, `None` if the rollout has to wait (or was paused).
    fn evaluate_group(
        &self,
        rollout_id: RolloutId,
        group: &RolloutGroup,
    ) -> RolloutResult<Option<GroupStatus>> {
        let evaluation = self.groups.evaluate(group)?;
        if evaluation.informational_error {
            self.groups.mark_error_action_taken(rollout_id, group.id)?;
            warn!(
                rollout = rollout_id,
                group = group.id,
                errors = evaluation.counts.error,
                "error threshold tripped, continuing"
            );
            self.events.publish(RolloutEvent::ErrorThresholdTripped {
                rollout: rollout_id,
                group: group.id,
                errors: evaluation.counts.error,
            });
        }

        let to = match evaluation.verdict {
            GroupVerdict::Continue => return Ok(None),
            GroupVerdict::PauseRollout { errors } => {
                self.pause_on_error(rollout_id, group.id, errors)?;
                return Ok(None);
            }
            GroupVerdict::Finished => GroupStatus::Finished,
            GroupVerdict::Error { errors } => {
                self.events.publish(RolloutEvent::ErrorThresholdTripped {
                    rollout: rollout_id,
                    group: group.id,
                    errors,
                });
                GroupStatus::Error
            }
        };

        self.groups.complete(rollout_id, group.id, to)?;
        info!(rollout = rollout_id, group = group.id, status = ?to, "group completed");
        self.events.publish(RolloutEvent::GroupStatusChanged {
            rollout: rollout_id,
            group: group.id,
            from: GroupStatus::Running,
            to,
        });
        Ok(Some(to))
    }

    fn pause_on_error(
        &self,
        rollout_id: RolloutId,
        group_id: GroupId,
        errors: u64,
    ) -> RolloutResult<()> {
        self.store.write(|txn| {
            let mut group = txn.require_group(group_id)?;
            group.error_action_taken = true;
            txn.put_group(&group)?;
            txn.transition_rollout(
                rollout_id,
                &[RolloutStatus::Running],
                RolloutStatus::Paused,
                ENGINE_ACTOR,
            )?;
            Ok::<_, RolloutError>(())
        })?;
        warn!(
            rollout = rollout_id,
            group = group_id,
            errors,
            "error threshold tripped, rollout paused"
        );
        self.events.publish(RolloutEvent::ErrorThresholdTripped {
            rollout: rollout_id,
            group: group_id,
            errors,
        });
        self.status_changed(rollout_id, RolloutStatus::Running, RolloutStatus::Paused);
        Ok(())
    }

    fn start_group(&self, rollout_id: RolloutId, group: &RolloutGroup) -> RolloutResult<GroupStart> {
        let start = self.groups.start(rollout_id, group.id)?;
        match start {
            GroupStart::Started {
                actions,
                superseded,
            } => {
                info!(rollout = rollout_id, group = group.id, actions, superseded, "group started");
                self.events.publish(RolloutEvent::ActionsCreated {
                    rollout: rollout_id,
                    group: group.id,
                    created: actions,
                    superseded,
                });
                self.events.publish(RolloutEvent::GroupStatusChanged {
                    rollout: rollout_id,
                    group: group.id,
                    from: GroupStatus::Scheduled,
                    to: GroupStatus::Running,
                });
            }
            GroupStart::Empty => {
                info!(rollout = rollout_id, group = group.id, "empty group finished");
                self.events.publish(RolloutEvent::GroupStatusChanged {
                    rollout: rollout_id,
                    group: group.id,
                    from: GroupStatus::Scheduled,
                    to: GroupStatus::Finished,
                });
            }
            GroupStart::AlreadyStarted => {}
        }
        Ok(start)
    }

    // ── Failure handling ───────────────────────────────────────────

    /// Move a rollout whose step failed deterministically to a terminal
    /// status: `ERROR_CREATING` while creating, `ERROR_STARTING` while
    /// ready or starting, and `STOPPED` (with its open actions cancelled)
    /// once running.
    fn fail(&self, rollout: &Rollout, cause: RolloutError) -> RolloutResult<ProcessOutcome> {
        let to = match rollout.status {
            RolloutStatus::Creating => RolloutStatus::ErrorCreating,
            RolloutStatus::Ready | RolloutStatus::Starting => RolloutStatus::ErrorStarting,
            RolloutStatus::Running | RolloutStatus::Paused => RolloutStatus::Stopped,
            _ => {
                error!(rollout = rollout.id, error = %cause, "rollout step failed");
                return Err(cause);
            }
        };
        let reason = cause.to_string();
        let message = format!("rollout failed: {reason}");
        let written = self.store.write(|txn| {
            if to == RolloutStatus::Stopped {
                stop_in(txn, rollout.id, &[rollout.status], ENGINE_ACTOR, &message)
                    .map(|stopped| stopped.cancelled)
            } else {
                txn.transition_rollout(rollout.id, &[rollout.status], to, ENGINE_ACTOR)?;
                Ok(0)
            }
        });
        let cancelled = match written {
            Ok(cancelled) => cancelled,
            Err(RolloutError::StateConflict(msg)) => {
                debug!(rollout = rollout.id, %msg, "rollout changed before it could be failed");
                return Ok(ProcessOutcome::Idle);
            }
            Err(e) => return Err(e),
        };
        error!(rollout = rollout.id, error = %reason, status = ?to, cancelled, "rollout failed");
        self.status_changed(rollout.id, rollout.status, to);
        self.events.publish(RolloutEvent::Failed {
            rollout: rollout.id,
            status: to,
            reason,
        });
        if cancelled > 0 {
            self.events.publish(RolloutEvent::ActionsCancelled {
                rollout: rollout.id,
                count: cancelled,
            });
        }
        Ok(ProcessOutcome::Advanced)
    }

    fn status_changed(&self, rollout: RolloutId, from: RolloutStatus, to: RolloutStatus) {
        info!(rollout, ?from, ?to, "rollout status changed");
        self.events
            .publish(RolloutEvent::StatusChanged { rollout, from, to });
    }
}
