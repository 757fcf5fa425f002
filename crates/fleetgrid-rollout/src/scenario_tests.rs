//! End-to-end engine scenarios against an in-memory store.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use fleetgrid_core::{EngineConfig, NoneErrorAction};
use fleetgrid_state::{
    ActionStatus, DistributionId, ErrorAction, GroupConditions, GroupStatus, Rollout,
    RolloutStatus, StateStore, Threshold,
};

use crate::access::{AllowAll, Caller, Permission, PermissionPolicy};
use crate::assigner::{ActionAssigner, AssignOutcome};
use crate::controller::{ProcessOutcome, RolloutController};
use crate::error::RolloutError;
use crate::events::{BroadcastSink, RolloutEvent};
use crate::group::{GroupEngine, GroupStart};
use crate::management::RolloutManagement;
use crate::strategy::{CreateRolloutRequest, GroupDefinition, GroupingSpec};

struct Fixture {
    store: StateStore,
    management: RolloutManagement,
    controller: RolloutController,
    events: BroadcastSink,
    config: EngineConfig,
    distribution: DistributionId,
}

fn fixture() -> Fixture {
    fixture_with(EngineConfig::default())
}

fn fixture_with(config: EngineConfig) -> Fixture {
    let store = StateStore::open_in_memory().unwrap();
    let events = BroadcastSink::new(256);
    let sink = Arc::new(events.clone());
    let management =
        RolloutManagement::new(store.clone(), config.clone(), Arc::new(AllowAll), sink.clone());
    let controller = RolloutController::new(store.clone(), &config, sink);
    let distribution = store
        .create_distribution("firmware", "2.1.0", vec!["os".into()])
        .unwrap()
        .id;
    Fixture {
        store,
        management,
        controller,
        events,
        config,
        distribution,
    }
}

impl Fixture {
    fn seed(&self, ring: &str, n: usize) {
        for i in 0..n {
            let id = format!("{ring}-{i:03}");
            self.store
                .register_target(
                    &id,
                    &id,
                    BTreeMap::from([("ring".to_string(), ring.to_string())]),
                )
                .unwrap();
        }
    }

    fn request(&self, name: &str, filter: &str, grouping: GroupingSpec) -> CreateRolloutRequest {
        CreateRolloutRequest {
            name: name.into(),
            description: None,
            distribution_id: self.distribution,
            target_filter: filter.into(),
            action_type: Default::default(),
            forced_time: None,
            grouping,
            default_conditions: GroupConditions::default(),
        }
    }

    fn create(&self, request: CreateRolloutRequest) -> Rollout {
        self.management
            .create_rollout(&Caller::system(), request)
            .unwrap()
    }

    /// Create, build and start a rollout; the first group is running after this.
    fn launch(&self, request: CreateRolloutRequest) -> Rollout {
        let rollout = self.create(request);
        assert_eq!(self.process(rollout.id), ProcessOutcome::Advanced);
        self.management
            .start_rollout(&Caller::system(), rollout.id)
            .unwrap();
        assert_eq!(self.process(rollout.id), ProcessOutcome::Advanced);
        self.rollout(rollout.id)
    }

    fn process(&self, id: u64) -> ProcessOutcome {
        self.controller.process(id).unwrap()
    }

    fn rollout(&self, id: u64) -> Rollout {
        self.store.get_rollout(id).unwrap().unwrap()
    }

    fn group_status(&self, rollout: &Rollout, index: usize) -> GroupStatus {
        self.store
            .get_group(rollout.group_ids[index])
            .unwrap()
            .unwrap()
            .status
    }

    /// Report `status` for the first `n` non-terminal actions of a group.
    fn report(&self, group_id: u64, status: ActionStatus, n: usize) {
        let pending: Vec<_> = self
            .store
            .list_group_actions(group_id)
            .unwrap()
            .into_iter()
            .filter(|a| !a.status.is_terminal())
            .take(n)
            .collect();
        assert_eq!(pending.len(), n, "not enough pending actions in group {group_id}");
        for action in pending {
            self.store
                .report_action_status(action.id, status, Some("device report"))
                .unwrap();
        }
    }

    fn drain_events(&self, rx: &mut tokio::sync::broadcast::Receiver<RolloutEvent>) -> Vec<RolloutEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }
}

fn error_conditions(error: Threshold, action: ErrorAction) -> GroupConditions {
    GroupConditions {
        success: Threshold::Percentage(100),
        error: Some(error),
        error_action: action,
    }
}

// ── Lifecycle ──────────────────────────────────────────────────────

#[test]
fn two_groups_run_to_completion() {
    let fx = fixture();
    fx.seed("main", 10);
    let rollout = fx.create(fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 2 }));
    assert_eq!(rollout.status, RolloutStatus::Creating);
    assert_eq!(rollout.group_ids.len(), 2);

    assert_eq!(fx.process(rollout.id), ProcessOutcome::Advanced);
    let ready = fx.rollout(rollout.id);
    assert_eq!(ready.status, RolloutStatus::Ready);
    assert_eq!(ready.total_targets, 10);
    assert_eq!(fx.group_status(&ready, 0), GroupStatus::Scheduled);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Idle);

    fx.management.start_rollout(&Caller::system(), rollout.id).unwrap();
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Advanced);
    let running = fx.rollout(rollout.id);
    assert_eq!(running.status, RolloutStatus::Running);
    assert_eq!(fx.group_status(&running, 0), GroupStatus::Running);
    assert_eq!(fx.group_status(&running, 1), GroupStatus::Scheduled);
    assert_eq!(fx.store.list_group_actions(running.group_ids[0]).unwrap().len(), 5);

    // nothing reported yet
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Idle);

    fx.report(running.group_ids[0], ActionStatus::Finished, 5);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Advanced);
    assert_eq!(fx.group_status(&running, 0), GroupStatus::Finished);
    assert_eq!(fx.group_status(&running, 1), GroupStatus::Running);

    fx.report(running.group_ids[1], ActionStatus::Finished, 5);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Advanced);
    let done = fx.rollout(rollout.id);
    assert_eq!(done.status, RolloutStatus::Finished);

    let status = fx
        .management
        .get_rollout_status(&Caller::system(), rollout.id)
        .unwrap();
    assert_eq!(status.counts.finished, 10);
    assert!(status.groups.iter().all(|g| g.finished_percent == 100.0));
}

#[test]
fn partial_success_threshold_advances_early() {
    let fx = fixture();
    fx.seed("main", 10);
    let mut request = fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 2 });
    request.default_conditions.success = Threshold::Percentage(60);
    let rollout = fx.launch(request);

    fx.report(rollout.group_ids[0], ActionStatus::Finished, 2);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Idle);
    fx.report(rollout.group_ids[0], ActionStatus::Finished, 1);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Advanced);
    assert_eq!(fx.group_status(&rollout, 0), GroupStatus::Finished);
    assert_eq!(fx.group_status(&rollout, 1), GroupStatus::Running);
}

#[test]
fn error_count_pauses_and_resume_continues() {
    let fx = fixture();
    fx.seed("main", 10);
    let mut rx = fx.events.subscribe();
    let mut request = fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 2 });
    request.default_conditions = error_conditions(Threshold::Count(1), ErrorAction::Pause);
    let rollout = fx.launch(request);
    let first = rollout.group_ids[0];

    fx.report(first, ActionStatus::Error, 1);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Idle);
    assert_eq!(fx.rollout(rollout.id).status, RolloutStatus::Paused);
    assert_eq!(fx.group_status(&rollout, 0), GroupStatus::Running);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Idle);

    let tripped = fx
        .drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, RolloutEvent::ErrorThresholdTripped { .. }))
        .count();
    assert_eq!(tripped, 1);

    fx.management.resume_rollout(&Caller::system(), rollout.id).unwrap();
    // the same error does not pause the rollout again
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Idle);
    assert_eq!(fx.rollout(rollout.id).status, RolloutStatus::Running);

    // every action terminal: the group is exhausted and finishes
    fx.report(first, ActionStatus::Finished, 4);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Advanced);
    assert_eq!(fx.group_status(&rollout, 0), GroupStatus::Finished);
    assert_eq!(fx.group_status(&rollout, 1), GroupStatus::Running);
}

#[test]
fn error_with_mark_group_error_policy_moves_on() {
    let fx = fixture_with(EngineConfig {
        none_error_action: NoneErrorAction::MarkGroupError,
        ..EngineConfig::default()
    });
    fx.seed("main", 4);
    let mut request = fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 2 });
    request.default_conditions = error_conditions(Threshold::Percentage(50), ErrorAction::None);
    let rollout = fx.launch(request);

    fx.report(rollout.group_ids[0], ActionStatus::Error, 1);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Advanced);
    assert_eq!(fx.group_status(&rollout, 0), GroupStatus::Error);
    assert_eq!(fx.group_status(&rollout, 1), GroupStatus::Running);
    assert_eq!(fx.rollout(rollout.id).status, RolloutStatus::Running);
}

#[test]
fn informational_error_keeps_group_running() {
    let fx = fixture();
    assert_eq!(fx.config.none_error_action, NoneErrorAction::Informational);
    fx.seed("main", 4);
    let mut rx = fx.events.subscribe();
    let mut request = fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 1 });
    request.default_conditions = error_conditions(Threshold::Count(1), ErrorAction::None);
    let rollout = fx.launch(request);

    fx.report(rollout.group_ids[0], ActionStatus::Error, 1);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Idle);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Idle);
    assert_eq!(fx.group_status(&rollout, 0), GroupStatus::Running);
    assert!(fx.store.get_group(rollout.group_ids[0]).unwrap().unwrap().error_action_taken);

    let tripped = fx
        .drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, RolloutEvent::ErrorThresholdTripped { .. }))
        .count();
    assert_eq!(tripped, 1);

    fx.report(rollout.group_ids[0], ActionStatus::Finished, 3);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Advanced);
    assert_eq!(fx.rollout(rollout.id).status, RolloutStatus::Finished);
}

#[test]
fn empty_group_is_skipped_in_the_same_tick() {
    let fx = fixture();
    fx.seed("canary", 2);
    fx.seed("main", 3);
    let groups = vec![
        GroupDefinition {
            name: "canary".into(),
            target_filter: Some("attribute.ring==canary".into()),
            ..Default::default()
        },
        GroupDefinition {
            name: "ghost".into(),
            target_filter: Some("attribute.ring==ghost".into()),
            ..Default::default()
        },
        GroupDefinition {
            name: "rest".into(),
            ..Default::default()
        },
    ];
    let rollout = fx.launch(fx.request("r1", "name==*", GroupingSpec::Explicit { groups }));
    assert_eq!(rollout.total_targets, 5);

    let ghost = fx.store.get_group(rollout.group_ids[1]).unwrap().unwrap();
    assert_eq!(ghost.total_targets, 0);
    assert_eq!(ghost.status, GroupStatus::Scheduled);

    fx.report(rollout.group_ids[0], ActionStatus::Finished, 2);
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Advanced);
    assert_eq!(fx.group_status(&rollout, 0), GroupStatus::Finished);
    assert_eq!(fx.group_status(&rollout, 1), GroupStatus::Finished);
    assert_eq!(fx.group_status(&rollout, 2), GroupStatus::Running);
    assert_eq!(fx.store.list_group_actions(rollout.group_ids[2]).unwrap().len(), 3);
}

// ── Group membership ───────────────────────────────────────────────

#[test]
fn groups_partition_the_population() {
    let fx = fixture();
    fx.seed("main", 10);
    fx.seed("other", 4);
    let rollout = fx.create(fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 3 }));
    fx.process(rollout.id);

    let mut seen = HashSet::new();
    let mut sizes = Vec::new();
    for group_id in &rollout.group_ids {
        let members = fx.store.group_target_ids(*group_id, 0, usize::MAX).unwrap();
        sizes.push(members.len());
        for m in members {
            assert!(m.starts_with("main-"));
            assert!(seen.insert(m), "target in two groups");
        }
    }
    assert_eq!(sizes, vec![3, 4, 3]);
    assert_eq!(seen.len(), 10);

    let page = fx
        .management
        .list_group_targets(&Caller::system(), rollout.group_ids[1], 1, 2)
        .unwrap();
    assert_eq!(page.len(), 2);
}

#[test]
fn targets_registered_after_creation_are_not_included() {
    let fx = fixture();
    fx.seed("main", 3);
    let rollout = fx.create(fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 1 }));
    let mut late = fx.store.get_target("main-000").unwrap().unwrap();
    late.controller_id = "main-late".into();
    late.created_at = rollout.created_at + 60_000;
    fx.store.put_target(&late).unwrap();

    fx.process(rollout.id);
    assert_eq!(fx.rollout(rollout.id).total_targets, 3);
}

// ── Assignment ─────────────────────────────────────────────────────

#[test]
fn assignment_is_idempotent() {
    let fx = fixture();
    fx.seed("main", 5);
    let rollout = fx.launch(fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 1 }));
    let group = fx.store.get_group(rollout.group_ids[0]).unwrap().unwrap();

    let engine = GroupEngine::new(fx.store.clone(), &fx.config);
    assert_eq!(engine.start(rollout.id, group.id).unwrap(), GroupStart::AlreadyStarted);

    let outcome = fx
        .store
        .write(|txn| ActionAssigner.assign_in(txn, &rollout, &group))
        .unwrap();
    assert_eq!(outcome, AssignOutcome::AlreadyAssigned);
    assert_eq!(fx.store.list_group_actions(group.id).unwrap().len(), 5);
}

#[test]
fn newer_rollout_supersedes_open_actions() {
    let fx = fixture();
    fx.seed("main", 3);
    let old = fx.launch(fx.request("old", "attribute.ring==main", GroupingSpec::Equal { groups: 1 }));
    let new = fx.launch(fx.request("new", "attribute.ring==main", GroupingSpec::Equal { groups: 1 }));

    for action in fx.store.list_group_actions(old.group_ids[0]).unwrap() {
        assert_eq!(action.status, ActionStatus::Canceled);
        assert!(!action.active);
    }
    for target in ["main-000", "main-001", "main-002"] {
        let active: Vec<_> = fx
            .store
            .list_target_actions(target)
            .unwrap()
            .into_iter()
            .filter(|a| a.active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rollout_id, Some(new.id));
    }

    // the superseded group has nothing left to wait for
    assert_eq!(fx.process(old.id), ProcessOutcome::Advanced);
    assert_eq!(fx.rollout(old.id).status, RolloutStatus::Finished);
}

// ── Operator commands ──────────────────────────────────────────────

#[test]
fn stop_cancels_open_actions() {
    let fx = fixture();
    fx.seed("main", 6);
    let mut rx = fx.events.subscribe();
    let rollout = fx.launch(fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 2 }));
    let first = rollout.group_ids[0];
    fx.report(first, ActionStatus::Finished, 1);
    fx.report(first, ActionStatus::Download, 1);
    fx.drain_events(&mut rx);

    let stopped = fx.management.stop_rollout(&Caller::system(), rollout.id).unwrap();
    assert_eq!(stopped.status, RolloutStatus::Stopped);

    let actions = fx.store.list_group_actions(first).unwrap();
    assert_eq!(
        actions.iter().filter(|a| a.status == ActionStatus::Canceling).count(),
        2
    );
    assert!(actions
        .iter()
        .filter(|a| a.status == ActionStatus::Canceling)
        .all(|a| a.active));
    assert_eq!(
        actions.iter().filter(|a| a.status == ActionStatus::Finished).count(),
        1
    );
    assert!(fx.store.list_group_actions(rollout.group_ids[1]).unwrap().is_empty());

    let events = fx.drain_events(&mut rx);
    assert!(events.contains(&RolloutEvent::ActionsCancelled {
        rollout: rollout.id,
        count: 2,
    }));

    assert_eq!(fx.process(rollout.id), ProcessOutcome::Idle);
    let err = fx
        .management
        .resume_rollout(&Caller::system(), rollout.id)
        .unwrap_err();
    assert!(matches!(err, RolloutError::StateConflict(_)));
}

#[test]
fn late_progress_report_does_not_undo_stop() {
    let fx = fixture();
    fx.seed("main", 2);
    let rollout = fx.launch(fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 1 }));
    let first = rollout.group_ids[0];
    fx.management.stop_rollout(&Caller::system(), rollout.id).unwrap();

    // the device had not seen the cancel request yet
    fx.report(first, ActionStatus::Download, 2);
    let actions = fx.store.list_group_actions(first).unwrap();
    assert!(actions
        .iter()
        .all(|a| a.status == ActionStatus::Canceling && a.active));

    fx.report(first, ActionStatus::Canceled, 2);
    let actions = fx.store.list_group_actions(first).unwrap();
    assert!(actions
        .iter()
        .all(|a| a.status == ActionStatus::Canceled && !a.active));
    assert_eq!(fx.rollout(rollout.id).status, RolloutStatus::Stopped);
}

#[test]
fn trigger_next_group_skips_success_condition() {
    let fx = fixture();
    fx.seed("main", 9);
    let mut rx = fx.events.subscribe();
    let rollout = fx.launch(fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 3 }));
    fx.report(rollout.group_ids[0], ActionStatus::Finished, 1);
    fx.drain_events(&mut rx);

    let next = fx
        .management
        .trigger_next_group(&Caller::system(), rollout.id)
        .unwrap();
    assert_eq!(next.id, rollout.group_ids[1]);
    assert_eq!(next.status, GroupStatus::Running);
    assert_eq!(fx.group_status(&rollout, 0), GroupStatus::Finished);
    assert_eq!(fx.group_status(&rollout, 2), GroupStatus::Scheduled);
    assert_eq!(fx.store.list_group_actions(next.id).unwrap().len(), 3);
    // open actions of the finished group stay with the devices
    assert_eq!(
        fx.store
            .list_group_actions(rollout.group_ids[0])
            .unwrap()
            .iter()
            .filter(|a| a.status == ActionStatus::Running && a.active)
            .count(),
        2
    );

    let events = fx.drain_events(&mut rx);
    assert!(events.contains(&RolloutEvent::ActionsCreated {
        rollout: rollout.id,
        group: next.id,
        created: 3,
        superseded: 0,
    }));
    assert!(events.contains(&RolloutEvent::GroupStatusChanged {
        rollout: rollout.id,
        group: rollout.group_ids[0],
        from: GroupStatus::Running,
        to: GroupStatus::Finished,
    }));

    fx.management
        .trigger_next_group(&Caller::system(), rollout.id)
        .unwrap();
    let err = fx
        .management
        .trigger_next_group(&Caller::system(), rollout.id)
        .unwrap_err();
    assert!(matches!(err, RolloutError::StateConflict(_)));
    assert_eq!(fx.group_status(&rollout, 2), GroupStatus::Running);

    fx.management.pause_rollout(&Caller::system(), rollout.id).unwrap();
    let err = fx
        .management
        .trigger_next_group(&Caller::system(), rollout.id)
        .unwrap_err();
    assert!(matches!(err, RolloutError::StateConflict(_)));
}

#[test]
fn illegal_transitions_are_rejected() {
    let fx = fixture();
    fx.seed("main", 2);
    let rollout = fx.create(fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 1 }));
    let admin = Caller::system();

    assert!(matches!(
        fx.management.start_rollout(&admin, rollout.id),
        Err(RolloutError::StateConflict(_))
    ));
    assert!(matches!(
        fx.management.pause_rollout(&admin, rollout.id),
        Err(RolloutError::StateConflict(_))
    ));
    assert!(matches!(
        fx.management.delete_rollout(&admin, rollout.id),
        Err(RolloutError::StateConflict(_))
    ));
    assert!(matches!(
        fx.management.start_rollout(&admin, 999),
        Err(RolloutError::NotFound(_))
    ));
}

#[test]
fn delete_hides_terminal_rollouts() {
    let fx = fixture();
    fx.seed("main", 2);
    let admin = Caller::system();
    let rollout = fx.create(fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 1 }));
    fx.management.stop_rollout(&admin, rollout.id).unwrap();
    fx.management.delete_rollout(&admin, rollout.id).unwrap();

    assert!(matches!(
        fx.management.get_rollout(&admin, rollout.id),
        Err(RolloutError::NotFound(_))
    ));
    assert!(fx.management.list_rollouts(&admin).unwrap().is_empty());
    assert!(matches!(
        fx.management.get_group_status(&admin, rollout.group_ids[0]),
        Err(RolloutError::NotFound(_))
    ));
}

// ── Creation checks ────────────────────────────────────────────────

#[test]
fn create_rejects_bad_requests() {
    let fx = fixture();
    fx.seed("main", 4);
    let admin = Caller::system();
    let equal = || GroupingSpec::Equal { groups: 2 };

    let err = fx
        .management
        .create_rollout(&admin, fx.request("r1", "attribute.ring==none", equal()))
        .unwrap_err();
    assert!(matches!(err, RolloutError::InvalidConfig(_)));

    let err = fx
        .management
        .create_rollout(&admin, fx.request("r1", "ring===main", equal()))
        .unwrap_err();
    assert!(matches!(err, RolloutError::Filter(_)));

    let mut request = fx.request("r1", "attribute.ring==main", equal());
    request.distribution_id = 42;
    assert!(matches!(
        fx.management.create_rollout(&admin, request),
        Err(RolloutError::NotFound(_))
    ));

    let explicit = GroupingSpec::Explicit {
        groups: vec![GroupDefinition {
            name: "half".into(),
            target_percentage: Some(50.0),
            ..Default::default()
        }],
    };
    assert!(matches!(
        fx.management
            .create_rollout(&admin, fx.request("r1", "attribute.ring==main", explicit)),
        Err(RolloutError::InvalidConfig(_))
    ));

    let mut request = fx.request("r1", "attribute.ring==main", equal());
    request.action_type = fleetgrid_state::ActionType::TimeForced;
    assert!(matches!(
        fx.management.create_rollout(&admin, request),
        Err(RolloutError::InvalidConfig(_))
    ));

    fx.create(fx.request("r1", "attribute.ring==main", equal()));
    assert!(matches!(
        fx.management
            .create_rollout(&admin, fx.request("r1", "attribute.ring==main", equal())),
        Err(RolloutError::AlreadyExists(_))
    ));
}

#[test]
fn create_rejects_invalidated_distribution() {
    let fx = fixture();
    fx.seed("main", 2);
    fx.store.invalidate_distribution(fx.distribution).unwrap();
    let err = fx
        .management
        .create_rollout(
            &Caller::system(),
            fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 1 }),
        )
        .unwrap_err();
    assert!(matches!(err, RolloutError::InvalidConfig(_)));
}

// ── Failures ───────────────────────────────────────────────────────

#[test]
fn distribution_invalidated_while_starting_fails_rollout() {
    let fx = fixture();
    fx.seed("main", 2);
    let rollout = fx.create(fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 1 }));
    fx.process(rollout.id);
    fx.management.start_rollout(&Caller::system(), rollout.id).unwrap();
    fx.store.invalidate_distribution(fx.distribution).unwrap();

    assert_eq!(fx.process(rollout.id), ProcessOutcome::Advanced);
    assert_eq!(fx.rollout(rollout.id).status, RolloutStatus::ErrorStarting);
    assert!(fx.store.list_group_actions(rollout.group_ids[0]).unwrap().is_empty());
}

#[test]
fn vanished_population_fails_creation() {
    let fx = fixture();
    fx.seed("main", 3);
    let rollout = fx.create(fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 1 }));
    for mut target in fx.store.list_targets().unwrap() {
        target.attributes.insert("ring".into(), "gone".into());
        fx.store.put_target(&target).unwrap();
    }

    assert_eq!(fx.process(rollout.id), ProcessOutcome::Advanced);
    assert_eq!(fx.rollout(rollout.id).status, RolloutStatus::ErrorCreating);
}

#[test]
fn broken_running_rollout_is_stopped() {
    let fx = fixture();
    fx.seed("main", 4);
    let mut rx = fx.events.subscribe();
    let rollout = fx.launch(fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 2 }));
    let first = rollout.group_ids[0];
    fx.store
        .write(|txn| {
            let mut group = txn.require_group(first)?;
            group.status = GroupStatus::Creating;
            txn.put_group(&group)
        })
        .unwrap();
    fx.drain_events(&mut rx);

    assert_eq!(fx.process(rollout.id), ProcessOutcome::Advanced);
    let stopped = fx.rollout(rollout.id);
    assert_eq!(stopped.status, RolloutStatus::Stopped);
    assert_eq!(stopped.updated_by, "system");
    assert!(fx
        .store
        .list_group_actions(first)
        .unwrap()
        .iter()
        .all(|a| a.status == ActionStatus::Canceling));

    let events = fx.drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        RolloutEvent::Failed { rollout: id, status: RolloutStatus::Stopped, .. } if *id == rollout.id
    )));
    assert!(events.contains(&RolloutEvent::ActionsCancelled {
        rollout: rollout.id,
        count: 2,
    }));

    // terminal: nothing left to retry
    assert_eq!(fx.process(rollout.id), ProcessOutcome::Idle);
    assert!(fx.store.list_group_actions(rollout.group_ids[1]).unwrap().is_empty());
}

// ── Authorization ──────────────────────────────────────────────────

#[test]
fn permissions_are_enforced() {
    let fx = fixture();
    fx.seed("main", 2);
    let guarded = RolloutManagement::new(
        fx.store.clone(),
        fx.config.clone(),
        Arc::new(PermissionPolicy),
        Arc::new(fx.events.clone()),
    );
    let viewer = Caller::new("viewer", [Permission::ReadRollout]);
    let operator = Caller::new(
        "operator",
        [Permission::ReadRollout, Permission::CreateRollout],
    );

    let request = fx.request("r1", "attribute.ring==main", GroupingSpec::Equal { groups: 1 });
    assert!(matches!(
        guarded.create_rollout(&viewer, request.clone()),
        Err(RolloutError::Forbidden(_))
    ));
    let rollout = guarded.create_rollout(&operator, request).unwrap();
    assert_eq!(rollout.created_by, "operator");

    assert_eq!(guarded.list_rollouts(&viewer).unwrap().len(), 1);
    assert!(matches!(
        guarded.stop_rollout(&operator, rollout.id),
        Err(RolloutError::Forbidden(_))
    ));
    assert!(matches!(
        guarded.trigger_next_group(&operator, rollout.id),
        Err(RolloutError::Forbidden(_))
    ));
    guarded.authorize_events(&viewer).unwrap();
    assert!(matches!(
        guarded.authorize_events(&Caller::new("nobody", std::iter::empty())),
        Err(RolloutError::Forbidden(_))
    ));
    assert!(matches!(
        guarded.get_rollout(&Caller::new("nobody", std::iter::empty()), rollout.id),
        Err(RolloutError::Forbidden(_))
    ));
    assert_eq!(fx.rollout(rollout.id).status, RolloutStatus::Creating);
}
