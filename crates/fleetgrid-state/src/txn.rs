//! Write transaction handle passed to [`StateStore::write`](crate::StateStore::write) closures.
//!
//! Every method opens the tables it needs for the duration of the call only,
//! so methods can be freely combined inside one closure. Index tables are
//! always updated together with the record they point to.

use fleetgrid_core::TargetFilter;
use redb::{ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::{
    decode, encode, find_rollout_by_name_in, get_json, list_groups_in,
    query_targets_in, scan_prefix,
};
use crate::tables::*;
use crate::types::*;

/// Which actions a bulk status switch considers.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionScope {
    Rollout(RolloutId),
    Group(GroupId),
    Target(TargetId),
}

/// Precondition of a bulk status switch.
///
/// An action is switched only if, at the time the transaction reads it, it
/// is in `scope`, its status is one of `statuses`, its active flag equals
/// `active` (when set) and it does not belong to `exclude_group`.
#[derive(Debug, Clone)]
pub struct ActionSelector {
    pub scope: ActionScope,
    pub statuses: Vec<ActionStatus>,
    pub active: Option<bool>,
    pub exclude_group: Option<GroupId>,
}

impl ActionSelector {
    pub fn new(scope: ActionScope, statuses: &[ActionStatus]) -> Self {
        Self {
            scope,
            statuses: statuses.to_vec(),
            active: None,
            exclude_group: None,
        }
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn excluding_group(mut self, group: GroupId) -> Self {
        self.exclude_group = Some(group);
        self
    }

    fn matches(&self, action: &Action) -> bool {
        self.statuses.contains(&action.status)
            && self.active.is_none_or(|a| a == action.active)
            && (self.exclude_group.is_none() || action.group_id != self.exclude_group)
    }
}

pub struct StoreTxn {
    txn: WriteTransaction,
}

impl StoreTxn {
    pub(crate) fn new(txn: WriteTransaction) -> Self {
        Self { txn }
    }

    pub(crate) fn commit(self) -> StateResult<()> {
        self.txn.commit().map_err(map_err!(Transaction))
    }

    pub(crate) fn abort(self) -> StateResult<()> {
        self.txn.abort().map_err(map_err!(Transaction))
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        get_json(&table, key)
    }

    fn put<T: serde::Serialize>(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = encode(value)?;
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        table
            .insert(key, bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn child_keys(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        prefix: &str,
    ) -> StateResult<Vec<String>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        scan_prefix(&table, prefix, |key, _| {
            keys.push(child_of(key).to_string());
            Ok(true)
        })?;
        Ok(keys)
    }

    /// Allocate the next id of a sequence (ids start at 1).
    pub fn next_id(&self, kind: &str) -> StateResult<u64> {
        let mut table = self.txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        let current = table
            .get(kind)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(kind, next).map_err(map_err!(Write))?;
        Ok(next)
    }

    // ── Targets & distributions ────────────────────────────────────

    pub fn get_target(&self, controller_id: &str) -> StateResult<Option<Target>> {
        self.get(TARGETS, controller_id)
    }

    pub fn put_target(&self, target: &Target) -> StateResult<()> {
        if !Target::is_valid_controller_id(&target.controller_id) {
            return Err(StateError::InvalidInput(format!(
                "invalid controller id: {:?}",
                target.controller_id
            )));
        }
        self.put(TARGETS, &target.controller_id, target)
    }

    pub fn query_targets(
        &self,
        filter: &TargetFilter,
        created_before: Option<u64>,
    ) -> StateResult<Vec<Target>> {
        let table = self.txn.open_table(TARGETS).map_err(map_err!(Table))?;
        query_targets_in(&table, filter, created_before)
    }

    pub fn get_distribution(&self, id: DistributionId) -> StateResult<Option<Distribution>> {
        self.get(DISTRIBUTIONS, &id_key(id))
    }

    pub fn put_distribution(&self, dist: &Distribution) -> StateResult<()> {
        self.put(DISTRIBUTIONS, &id_key(dist.id), dist)
    }

    // ── Rollouts & groups ──────────────────────────────────────────

    pub fn get_rollout(&self, id: RolloutId) -> StateResult<Option<Rollout>> {
        self.get(ROLLOUTS, &id_key(id))
    }

    pub fn require_rollout(&self, id: RolloutId) -> StateResult<Rollout> {
        self.get_rollout(id)?
            .ok_or_else(|| StateError::NotFound(format!("rollout {id}")))
    }

    pub fn put_rollout(&self, rollout: &Rollout) -> StateResult<()> {
        self.put(ROLLOUTS, &id_key(rollout.id), rollout)
    }

    pub fn find_rollout_by_name(&self, name: &str) -> StateResult<Option<Rollout>> {
        let table = self.txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        find_rollout_by_name_in(&table, name)
    }

    /// Conditional rollout status update: applied only if the rollout is
    /// currently in one of `from`.
    pub fn transition_rollout(
        &self,
        id: RolloutId,
        from: &[RolloutStatus],
        to: RolloutStatus,
        actor: &str,
    ) -> StateResult<Rollout> {
        let mut rollout = self.require_rollout(id)?;
        if !from.contains(&rollout.status) {
            return Err(StateError::Conflict(format!(
                "rollout {id} is {:?}, expected one of {from:?}",
                rollout.status
            )));
        }
        rollout.status = to;
        rollout.updated_by = actor.to_string();
        rollout.updated_at = epoch_millis();
        self.put_rollout(&rollout)?;
        Ok(rollout)
    }

    pub fn get_group(&self, id: GroupId) -> StateResult<Option<RolloutGroup>> {
        self.get(GROUPS, &id_key(id))
    }

    pub fn require_group(&self, id: GroupId) -> StateResult<RolloutGroup> {
        self.get_group(id)?
            .ok_or_else(|| StateError::NotFound(format!("group {id}")))
    }

    pub fn put_group(&self, group: &RolloutGroup) -> StateResult<()> {
        self.put(GROUPS, &id_key(group.id), group)
    }

    pub fn list_groups(&self, rollout_id: RolloutId) -> StateResult<Vec<RolloutGroup>> {
        let rollouts = self.txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let groups = self.txn.open_table(GROUPS).map_err(map_err!(Table))?;
        list_groups_in(&rollouts, &groups, rollout_id)
    }

    /// Conditional group status update: applied only if the group is
    /// currently `from`.
    pub fn transition_group(
        &self,
        id: GroupId,
        from: GroupStatus,
        to: GroupStatus,
    ) -> StateResult<RolloutGroup> {
        let mut group = self.require_group(id)?;
        if group.status != from {
            return Err(StateError::Conflict(format!(
                "group {id} is {:?}, expected {from:?}",
                group.status
            )));
        }
        group.status = to;
        group.updated_at = epoch_millis();
        self.put_group(&group)?;
        Ok(group)
    }

    // ── Group membership ───────────────────────────────────────────

    /// Group a target already belongs to within `rollout_id`.
    pub fn assigned_group(&self, rollout_id: RolloutId, target: &str) -> StateResult<Option<GroupId>> {
        self.get(ROLLOUT_TARGETS, &pair_key(rollout_id, target))
    }

    /// Add `target` to `group`. Returns `false` without writing if the target
    /// already belongs to a group of the same rollout.
    pub fn assign_target(
        &self,
        rollout_id: RolloutId,
        group_id: GroupId,
        target: &str,
    ) -> StateResult<bool> {
        if self.assigned_group(rollout_id, target)?.is_some() {
            return Ok(false);
        }
        self.put(ROLLOUT_TARGETS, &pair_key(rollout_id, target), &group_id)?;
        self.put(GROUP_TARGETS, &pair_key(group_id, target), &rollout_id)?;
        Ok(true)
    }

    pub fn group_target_ids(&self, group_id: GroupId) -> StateResult<Vec<TargetId>> {
        self.child_keys(GROUP_TARGETS, &id_prefix(group_id))
    }

    pub fn group_has_actions(&self, group_id: GroupId) -> StateResult<bool> {
        let table = self.txn.open_table(GROUP_ACTIONS).map_err(map_err!(Table))?;
        let mut found = false;
        scan_prefix(&table, &id_prefix(group_id), |_, _| {
            found = true;
            Ok(false)
        })?;
        Ok(found)
    }

    // ── Actions ────────────────────────────────────────────────────

    pub fn get_action(&self, id: ActionId) -> StateResult<Option<Action>> {
        self.get(ACTIONS, &id_key(id))
    }

    /// Persist an action together with its index rows.
    fn store_action(&self, action: &Action) -> StateResult<()> {
        self.put(ACTIONS, &id_key(action.id), action)?;
        if let Some(group) = action.group_id {
            self.put(GROUP_ACTIONS, &id_pair_key(group, action.id), &action.status)?;
        }
        if let Some(rollout) = action.rollout_id {
            self.put(
                ROLLOUT_ACTIONS,
                &id_pair_key(rollout, action.id),
                &action.status,
            )?;
        }
        self.put(
            TARGET_ACTIONS,
            &target_action_key(&action.target_id, action.id),
            &action.status,
        )
    }

    pub fn insert_action(&self, new: NewAction, message: Option<&str>) -> StateResult<Action> {
        let now = epoch_millis();
        let action = Action {
            id: self.next_id("action")?,
            target_id: new.target_id,
            distribution_id: new.distribution_id,
            rollout_id: new.rollout_id,
            group_id: new.group_id,
            status: new.status,
            active: new.active,
            action_type: new.action_type,
            forced_time: new.forced_time,
            created_at: now,
            updated_at: now,
        };
        self.store_action(&action)?;
        self.append_history(action.id, action.status, message)?;
        Ok(action)
    }

    /// Move one action to `status`, deactivating it if asked, with history.
    pub fn set_action_status(
        &self,
        mut action: Action,
        status: ActionStatus,
        deactivate: bool,
        message: Option<&str>,
    ) -> StateResult<Action> {
        action.status = status;
        if deactivate {
            action.active = false;
        }
        action.updated_at = epoch_millis();
        self.store_action(&action)?;
        self.append_history(action.id, status, message)?;
        Ok(action)
    }

    /// Atomic conditional bulk update.
    ///
    /// Every action selected by `selector` whose current row still satisfies
    /// the selector's precondition is switched to `to`. Rows changed by a
    /// concurrently committed device report are re-read here and skipped if
    /// they no longer match. Returns the ids that were switched.
    pub fn switch_actions(
        &self,
        selector: &ActionSelector,
        to: ActionStatus,
        deactivate: bool,
        message: Option<&str>,
    ) -> StateResult<Vec<ActionId>> {
        let candidates = match &selector.scope {
            ActionScope::Rollout(id) => self.indexed_candidates(ROLLOUT_ACTIONS, &id_prefix(*id), selector)?,
            ActionScope::Group(id) => self.indexed_candidates(GROUP_ACTIONS, &id_prefix(*id), selector)?,
            ActionScope::Target(target) => {
                self.indexed_candidates(TARGET_ACTIONS, &format!("{target}/"), selector)?
            }
        };

        let mut switched = Vec::new();
        for id in candidates {
            let Some(action) = self.get_action(id)? else {
                continue;
            };
            if !selector.matches(&action) {
                continue;
            }
            self.set_action_status(action, to, deactivate || to.is_terminal(), message)?;
            switched.push(id);
        }
        if !switched.is_empty() {
            debug!(count = switched.len(), ?to, scope = ?selector.scope, "actions switched");
        }
        Ok(switched)
    }

    /// Action ids from an index table whose indexed status is selected.
    fn indexed_candidates(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        prefix: &str,
        selector: &ActionSelector,
    ) -> StateResult<Vec<ActionId>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let mut ids = Vec::new();
        scan_prefix(&table, prefix, |key, value| {
            let status: ActionStatus = decode(value)?;
            if selector.statuses.contains(&status) {
                let id = child_of(key)
                    .parse::<u64>()
                    .map_err(|e| StateError::Deserialize(format!("action key {key}: {e}")))?;
                ids.push(id);
            }
            Ok(true)
        })?;
        Ok(ids)
    }

    pub fn append_history(
        &self,
        action_id: ActionId,
        status: ActionStatus,
        message: Option<&str>,
    ) -> StateResult<()> {
        let seq = {
            let table = self.txn.open_table(ACTION_HISTORY).map_err(map_err!(Table))?;
            let mut count = 0u32;
            scan_prefix(&table, &id_prefix(action_id), |_, _| {
                count += 1;
                Ok(true)
            })?;
            count
        };
        let entry = ActionStatusEntry {
            action_id,
            seq,
            status,
            message: message.map(str::to_string),
            occurred_at: epoch_millis(),
        };
        self.put(ACTION_HISTORY, &history_key(action_id, seq), &entry)
    }

    // ── Leases ─────────────────────────────────────────────────────

    pub fn get_lease(&self, rollout_id: RolloutId) -> StateResult<Option<Lease>> {
        self.get(LEASES, &id_key(rollout_id))
    }

    pub fn put_lease(&self, lease: &Lease) -> StateResult<()> {
        self.put(LEASES, &id_key(lease.rollout_id), lease)
    }

    pub fn remove_lease(&self, rollout_id: RolloutId) -> StateResult<bool> {
        let mut table = self.txn.open_table(LEASES).map_err(map_err!(Table))?;
        let existed = table
            .remove(id_key(rollout_id).as_str())
            .map_err(map_err!(Write))?
            .is_some();
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateStore;

    fn seed_target(store: &StateStore, id: &str) {
        store
            .put_target(&Target {
                controller_id: id.to_string(),
                name: id.to_string(),
                attributes: Default::default(),
                created_at: 1,
            })
            .unwrap();
    }

    fn new_action(target: &str, rollout: Option<u64>, group: Option<u64>) -> NewAction {
        NewAction {
            target_id: target.to_string(),
            distribution_id: 1,
            rollout_id: rollout,
            group_id: group,
            status: ActionStatus::Running,
            active: true,
            action_type: ActionType::Forced,
            forced_time: None,
        }
    }

    #[test]
    fn next_id_is_monotonic_per_kind() {
        let store = StateStore::open_in_memory().unwrap();
        let ids: (u64, u64, u64) = store
            .write(|txn| {
                Ok::<_, StateError>((txn.next_id("a")?, txn.next_id("a")?, txn.next_id("b")?))
            })
            .unwrap();
        assert_eq!(ids, (1, 2, 1));
    }

    #[test]
    fn assign_target_is_idempotent_per_rollout() {
        let store = StateStore::open_in_memory().unwrap();
        let (first, second, other_rollout) = store
            .write(|txn| {
                Ok::<_, StateError>((
                    txn.assign_target(1, 10, "dev-1")?,
                    txn.assign_target(1, 11, "dev-1")?,
                    txn.assign_target(2, 20, "dev-1")?,
                ))
            })
            .unwrap();
        assert!(first);
        assert!(!second);
        assert!(other_rollout);
        assert_eq!(store.group_target_ids(10, 0, 10).unwrap(), vec!["dev-1"]);
        assert!(store.group_target_ids(11, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn switch_actions_respects_precondition() {
        let store = StateStore::open_in_memory().unwrap();
        for t in ["dev-1", "dev-2", "dev-3"] {
            seed_target(&store, t);
        }
        let ids: Vec<u64> = store
            .write(|txn| {
                let mut ids = Vec::new();
                for t in ["dev-1", "dev-2", "dev-3"] {
                    ids.push(txn.insert_action(new_action(t, Some(7), Some(70)), None)?.id);
                }
                Ok::<_, StateError>(ids)
            })
            .unwrap();

        // a device finishes before the bulk switch commits
        store
            .report_action_status(ids[1], ActionStatus::Finished, None)
            .unwrap();

        let switched = store
            .write(|txn| {
                txn.switch_actions(
                    &ActionSelector::new(ActionScope::Rollout(7), &ActionStatus::NON_TERMINAL)
                        .active(true),
                    ActionStatus::Canceling,
                    false,
                    Some("stopped"),
                )
            })
            .unwrap();
        assert_eq!(switched, vec![ids[0], ids[2]]);

        let a = store.get_action(ids[0]).unwrap().unwrap();
        assert_eq!(a.status, ActionStatus::Canceling);
        assert!(a.active);
        let b = store.get_action(ids[1]).unwrap().unwrap();
        assert_eq!(b.status, ActionStatus::Finished);

        let hist = store.group_status_histogram(70).unwrap();
        assert_eq!(hist.get(&ActionStatus::Canceling), Some(&2));
        assert_eq!(hist.get(&ActionStatus::Finished), Some(&1));
        assert_eq!(
            store.rollout_status_histogram(7).unwrap(),
            hist,
            "rollout and group indexes agree"
        );
    }

    #[test]
    fn switch_actions_excludes_group_and_terminal_deactivates() {
        let store = StateStore::open_in_memory().unwrap();
        seed_target(&store, "dev-1");
        let (old, current) = store
            .write(|txn| {
                let old = txn.insert_action(new_action("dev-1", Some(1), Some(10)), None)?;
                let current = txn.insert_action(new_action("dev-1", Some(2), Some(20)), None)?;
                Ok::<_, StateError>((old.id, current.id))
            })
            .unwrap();

        let switched = store
            .write(|txn| {
                txn.switch_actions(
                    &ActionSelector::new(
                        ActionScope::Target("dev-1".into()),
                        &ActionStatus::NON_TERMINAL,
                    )
                    .excluding_group(20),
                    ActionStatus::Canceled,
                    false,
                    None,
                )
            })
            .unwrap();
        assert_eq!(switched, vec![old]);
        assert!(!store.get_action(old).unwrap().unwrap().active);
        assert!(store.get_action(current).unwrap().unwrap().active);
    }

    #[test]
    fn transition_rollout_checks_source_state() {
        let store = StateStore::open_in_memory().unwrap();
        let rollout = Rollout {
            id: 1,
            name: "r".into(),
            description: None,
            distribution_id: 1,
            target_filter: "name==*".into(),
            action_type: ActionType::Forced,
            forced_time: None,
            status: RolloutStatus::Ready,
            group_ids: vec![],
            default_conditions: GroupConditions::default(),
            total_targets: 0,
            deleted: false,
            created_by: "op".into(),
            updated_by: "op".into(),
            created_at: 1,
            updated_at: 1,
        };
        store.write(|txn| txn.put_rollout(&rollout)).unwrap();

        let err = store
            .write(|txn| {
                txn.transition_rollout(1, &[RolloutStatus::Running], RolloutStatus::Paused, "op")
            })
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));

        let r = store
            .write(|txn| {
                txn.transition_rollout(1, &[RolloutStatus::Ready], RolloutStatus::Starting, "bob")
            })
            .unwrap();
        assert_eq!(r.status, RolloutStatus::Starting);
        assert_eq!(r.updated_by, "bob");
    }
}
