//! redb table definitions for the FleetGrid state store.
//!
//! Record tables use zero-padded numeric keys (`{id:020}`) so that key order
//! equals id order. Index tables use composite keys `{parent}/{child}` and are
//! read with prefix range scans. All values are JSON.

use redb::TableDefinition;

pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");

pub const DISTRIBUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("distributions");

pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout_groups");

pub const ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("actions");

/// `{rollout}/{target}` -> group id. One row per target and rollout.
pub const ROLLOUT_TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout_targets");

/// `{group}/{target}` -> rollout id.
pub const GROUP_TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("group_targets");

/// `{group}/{action}` -> action status.
pub const GROUP_ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("group_actions");

/// `{rollout}/{action}` -> action status.
pub const ROLLOUT_ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout_actions");

/// `{target}/{action}` -> action status.
pub const TARGET_ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("target_actions");

/// `{action}/{seq}` -> status history entry.
pub const ACTION_HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("action_history");

/// `{rollout}` -> lease.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout_leases");

/// Id sequences keyed by record kind.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

pub fn id_key(id: u64) -> String {
    format!("{id:020}")
}

pub fn pair_key(parent: u64, child: &str) -> String {
    format!("{parent:020}/{child}")
}

pub fn id_pair_key(parent: u64, child: u64) -> String {
    format!("{parent:020}/{child:020}")
}

pub fn target_action_key(target: &str, action: u64) -> String {
    format!("{target}/{action:020}")
}

pub fn history_key(action: u64, seq: u32) -> String {
    format!("{action:020}/{seq:010}")
}

/// Prefix selecting every child of `parent` in an index table.
pub fn id_prefix(parent: u64) -> String {
    format!("{parent:020}/")
}

/// Child part of a composite key.
pub fn child_of(key: &str) -> &str {
    key.rsplit_once('/').map(|(_, child)| child).unwrap_or(key)
}
