//! StateStore — redb-backed state persistence for FleetGrid.
//!
//! Provides typed reads over targets, distributions, rollouts, groups and
//! actions, plus the transactional [`StateStore::write`] entry point used for
//! every mutation. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use fleetgrid_core::TargetFilter;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::txn::StoreTxn;
use crate::types::*;

// ── Codec helpers ──────────────────────────────────────────────────

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

pub(crate) fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Visit every row whose key starts with `prefix`, in key order.
/// The visitor returns `false` to stop early.
pub(crate) fn scan_prefix<F>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
    mut visit: F,
) -> StateResult<()>
where
    F: FnMut(&str, &[u8]) -> StateResult<bool>,
{
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        if !visit(key, value.value())? {
            break;
        }
    }
    Ok(())
}

pub(crate) fn scan_all<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

pub(crate) fn query_targets_in(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    filter: &TargetFilter,
    created_before: Option<u64>,
) -> StateResult<Vec<Target>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let target: Target = decode(value.value())?;
        if created_before.is_none_or(|cutoff| target.created_at <= cutoff)
            && filter.matches(&target)
        {
            results.push(target);
        }
    }
    Ok(results)
}

pub(crate) fn histogram_in(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<StatusHistogram> {
    let mut counts = BTreeMap::new();
    scan_prefix(table, prefix, |_, value| {
        let status: ActionStatus = decode(value)?;
        *counts.entry(status).or_insert(0) += 1;
        Ok(true)
    })?;
    Ok(counts)
}

// ── Store ──────────────────────────────────────────────────────────

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for def in [
            TARGETS,
            DISTRIBUTIONS,
            ROLLOUTS,
            GROUPS,
            ACTIONS,
            ROLLOUT_TARGETS,
            GROUP_TARGETS,
            GROUP_ACTIONS,
            ROLLOUT_ACTIONS,
            TARGET_ACTIONS,
            ACTION_HISTORY,
            LEASES,
        ] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside one write transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and is aborted otherwise,
    /// so no partial write of a failed step is ever observable.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&StoreTxn) -> Result<T, E>,
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let store_txn = StoreTxn::new(txn);
        match f(&store_txn) {
            Ok(value) => {
                store_txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = store_txn.abort() {
                    warn!(error = %abort, "failed to abort write transaction");
                }
                Err(e)
            }
        }
    }

    pub(crate) fn read_table<T, F>(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        f: F,
    ) -> StateResult<T>
    where
        F: FnOnce(&redb::ReadOnlyTable<&'static str, &'static [u8]>) -> StateResult<T>,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        f(&table)
    }

    // ── Targets ────────────────────────────────────────────────────

    /// Insert or update a target record as given.
    pub fn put_target(&self, target: &Target) -> StateResult<()> {
        self.write(|txn| txn.put_target(target))?;
        debug!(controller = %target.controller_id, "target stored");
        Ok(())
    }

    /// Register a new target, stamped with the current time.
    pub fn register_target(
        &self,
        controller_id: &str,
        name: &str,
        attributes: BTreeMap<String, String>,
    ) -> StateResult<Target> {
        let target = Target {
            controller_id: controller_id.to_string(),
            name: name.to_string(),
            attributes,
            created_at: epoch_millis(),
        };
        self.write(|txn| {
            if txn.get_target(controller_id)?.is_some() {
                return Err(StateError::Conflict(format!(
                    "target {controller_id} already exists"
                )));
            }
            txn.put_target(&target)
        })?;
        debug!(controller = %controller_id, "target registered");
        Ok(target)
    }

    pub fn get_target(&self, controller_id: &str) -> StateResult<Option<Target>> {
        self.read_table(TARGETS, |t| get_json(t, controller_id))
    }

    pub fn list_targets(&self) -> StateResult<Vec<Target>> {
        self.read_table(TARGETS, |t| scan_all(t))
    }

    /// Targets matching `filter`, optionally restricted to those created at or
    /// before `created_before` (epoch ms).
    pub fn query_targets(
        &self,
        filter: &TargetFilter,
        created_before: Option<u64>,
    ) -> StateResult<Vec<Target>> {
        self.read_table(TARGETS, |t| query_targets_in(t, filter, created_before))
    }

    // ── Distributions ──────────────────────────────────────────────

    pub fn create_distribution(
        &self,
        name: &str,
        version: &str,
        modules: Vec<String>,
    ) -> StateResult<Distribution> {
        if name.trim().is_empty() || version.trim().is_empty() {
            return Err(StateError::InvalidInput(
                "distribution name and version are required".into(),
            ));
        }
        if modules.is_empty() {
            return Err(StateError::InvalidInput(
                "distribution has no software modules".into(),
            ));
        }
        let dist = self.write(|txn| {
            let dist = Distribution {
                id: txn.next_id("distribution")?,
                name: name.to_string(),
                version: version.to_string(),
                modules,
                valid: true,
                created_at: epoch_millis(),
            };
            txn.put_distribution(&dist)?;
            Ok::<_, StateError>(dist)
        })?;
        debug!(distribution = dist.id, "distribution created");
        Ok(dist)
    }

    pub fn get_distribution(&self, id: DistributionId) -> StateResult<Option<Distribution>> {
        self.read_table(DISTRIBUTIONS, |t| get_json(t, &id_key(id)))
    }

    pub fn list_distributions(&self) -> StateResult<Vec<Distribution>> {
        self.read_table(DISTRIBUTIONS, |t| scan_all(t))
    }

    /// Mark a distribution as no longer deployable.
    pub fn invalidate_distribution(&self, id: DistributionId) -> StateResult<Distribution> {
        let dist = self.write(|txn| {
            let mut dist = txn
                .get_distribution(id)?
                .ok_or_else(|| StateError::NotFound(format!("distribution {id}")))?;
            dist.valid = false;
            txn.put_distribution(&dist)?;
            Ok::<_, StateError>(dist)
        })?;
        debug!(distribution = id, "distribution invalidated");
        Ok(dist)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    pub fn get_rollout(&self, id: RolloutId) -> StateResult<Option<Rollout>> {
        self.read_table(ROLLOUTS, |t| get_json(t, &id_key(id)))
    }

    /// All rollouts ordered by id, soft-deleted ones only if asked for.
    pub fn list_rollouts(&self, include_deleted: bool) -> StateResult<Vec<Rollout>> {
        let all: Vec<Rollout> = self.read_table(ROLLOUTS, |t| scan_all(t))?;
        Ok(all
            .into_iter()
            .filter(|r| include_deleted || !r.deleted)
            .collect())
    }

    /// Non-deleted rollouts whose status is one of `statuses`.
    pub fn list_rollouts_in(&self, statuses: &[RolloutStatus]) -> StateResult<Vec<Rollout>> {
        Ok(self
            .list_rollouts(false)?
            .into_iter()
            .filter(|r| statuses.contains(&r.status))
            .collect())
    }

    pub fn find_rollout_by_name(&self, name: &str) -> StateResult<Option<Rollout>> {
        self.read_table(ROLLOUTS, |t| find_rollout_by_name_in(t, name))
    }

    // ── Groups ─────────────────────────────────────────────────────

    pub fn get_group(&self, id: GroupId) -> StateResult<Option<RolloutGroup>> {
        self.read_table(GROUPS, |t| get_json(t, &id_key(id)))
    }

    /// Groups of a rollout in execution order.
    pub fn list_groups(&self, rollout_id: RolloutId) -> StateResult<Vec<RolloutGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        list_groups_in(&rollouts, &groups, rollout_id)
    }

    /// Member targets of a group in key order, paged.
    pub fn group_target_ids(
        &self,
        group_id: GroupId,
        offset: usize,
        limit: usize,
    ) -> StateResult<Vec<TargetId>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.read_table(GROUP_TARGETS, |t| {
            let mut ids = Vec::new();
            let mut skipped = 0;
            scan_prefix(t, &id_prefix(group_id), |key, _| {
                if skipped < offset {
                    skipped += 1;
                    return Ok(true);
                }
                ids.push(child_of(key).to_string());
                Ok(ids.len() < limit)
            })?;
            Ok(ids)
        })
    }

    // ── Actions ────────────────────────────────────────────────────

    pub fn get_action(&self, id: ActionId) -> StateResult<Option<Action>> {
        self.read_table(ACTIONS, |t| get_json(t, &id_key(id)))
    }

    /// Action counts of a group by status, in one index scan.
    pub fn group_status_histogram(&self, group_id: GroupId) -> StateResult<StatusHistogram> {
        self.read_table(GROUP_ACTIONS, |t| histogram_in(t, &id_prefix(group_id)))
    }

    /// Action counts of a rollout by status, in one index scan.
    pub fn rollout_status_histogram(&self, rollout_id: RolloutId) -> StateResult<StatusHistogram> {
        self.read_table(ROLLOUT_ACTIONS, |t| histogram_in(t, &id_prefix(rollout_id)))
    }

    pub fn list_group_actions(&self, group_id: GroupId) -> StateResult<Vec<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(GROUP_ACTIONS).map_err(map_err!(Table))?;
        let actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        let mut ids = Vec::new();
        scan_prefix(&index, &id_prefix(group_id), |key, _| {
            ids.push(child_of(key).to_string());
            Ok(true)
        })?;
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(action) = get_json(&actions, &id)? {
                results.push(action);
            }
        }
        Ok(results)
    }

    /// Every action ever created for a target, oldest first.
    pub fn list_target_actions(&self, target_id: &str) -> StateResult<Vec<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(TARGET_ACTIONS).map_err(map_err!(Table))?;
        let actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        actions_for_target_in(&index, &actions, target_id)
    }

    pub fn action_history(&self, action_id: ActionId) -> StateResult<Vec<ActionStatusEntry>> {
        self.read_table(ACTION_HISTORY, |t| {
            let mut entries = Vec::new();
            scan_prefix(t, &id_prefix(action_id), |_, value| {
                entries.push(decode(value)?);
                Ok(true)
            })?;
            Ok(entries)
        })
    }

    /// Record a status reported by a device for one of its actions.
    ///
    /// Appends history and updates the action atomically. Reports on an
    /// action that already reached a terminal status are rejected; a terminal
    /// status deactivates the action.
    ///
    /// A `CANCELING` action only leaves that status when the device answers
    /// the cancel request: `CANCELED` or `FINISHED` confirm it and close the
    /// action as `CANCELED`, `ERROR` rejects it and the action is `RUNNING`
    /// again. Any other report is kept in the history only.
    pub fn report_action_status(
        &self,
        action_id: ActionId,
        status: ActionStatus,
        message: Option<&str>,
    ) -> StateResult<Action> {
        let action = self.write(|txn| {
            let action = txn
                .get_action(action_id)?
                .ok_or_else(|| StateError::NotFound(format!("action {action_id}")))?;
            if action.status.is_terminal() {
                return Err(StateError::Conflict(format!(
                    "action {action_id} is already {:?}",
                    action.status
                )));
            }
            if action.status == ActionStatus::Canceling {
                return match status {
                    ActionStatus::Canceled | ActionStatus::Finished => {
                        txn.set_action_status(action, ActionStatus::Canceled, true, message)
                    }
                    ActionStatus::Error => {
                        txn.set_action_status(action, ActionStatus::Running, false, message)
                    }
                    _ => {
                        txn.append_history(action.id, status, message)?;
                        Ok(action)
                    }
                };
            }
            txn.set_action_status(action, status, status.is_terminal(), message)
        })?;
        debug!(action = action_id, ?status, "action status reported");
        Ok(action)
    }
}

// ── Shared readers ─────────────────────────────────────────────────

pub(crate) fn find_rollout_by_name_in(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    name: &str,
) -> StateResult<Option<Rollout>> {
    let all: Vec<Rollout> = scan_all(table)?;
    Ok(all.into_iter().find(|r| !r.deleted && r.name == name))
}

pub(crate) fn list_groups_in(
    rollouts: &impl ReadableTable<&'static str, &'static [u8]>,
    groups: &impl ReadableTable<&'static str, &'static [u8]>,
    rollout_id: RolloutId,
) -> StateResult<Vec<RolloutGroup>> {
    let rollout: Rollout = get_json(rollouts, &id_key(rollout_id))?
        .ok_or_else(|| StateError::NotFound(format!("rollout {rollout_id}")))?;
    let mut results = Vec::with_capacity(rollout.group_ids.len());
    for id in rollout.group_ids {
        let group = get_json(groups, &id_key(id))?
            .ok_or_else(|| StateError::NotFound(format!("group {id}")))?;
        results.push(group);
    }
    Ok(results)
}

pub(crate) fn actions_for_target_in(
    index: &impl ReadableTable<&'static str, &'static [u8]>,
    actions: &impl ReadableTable<&'static str, &'static [u8]>,
    target_id: &str,
) -> StateResult<Vec<Action>> {
    let mut ids = Vec::new();
    scan_prefix(index, &format!("{target_id}/"), |key, _| {
        ids.push(child_of(key).to_string());
        Ok(true)
    })?;
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(action) = get_json(actions, &id)? {
            results.push(action);
        }
    }
    Ok(results)
}
