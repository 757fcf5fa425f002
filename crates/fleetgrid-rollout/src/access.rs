//! Operator authorization.
//!
//! Every entry point of [`RolloutManagement`](crate::RolloutManagement) asks an
//! [`AccessPolicy`] whether the caller may perform the operation before it
//! touches the store.

use std::collections::HashSet;

use fleetgrid_state::RolloutId;
use serde::{Deserialize, Serialize};

use crate::error::{RolloutError, RolloutResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    ReadRollout,
    CreateRollout,
    /// start, pause, resume and stop.
    HandleRollout,
    DeleteRollout,
}

impl Permission {
    pub const ALL: [Permission; 4] = [
        Permission::ReadRollout,
        Permission::CreateRollout,
        Permission::HandleRollout,
        Permission::DeleteRollout,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "READ_ROLLOUT" => Some(Permission::ReadRollout),
            "CREATE_ROLLOUT" => Some(Permission::CreateRollout),
            "HANDLE_ROLLOUT" => Some(Permission::HandleRollout),
            "DELETE_ROLLOUT" => Some(Permission::DeleteRollout),
            _ => None,
        }
    }
}

/// Who is calling, and what they were granted.
#[derive(Debug, Clone)]
pub struct Caller {
    pub name: String,
    pub permissions: HashSet<Permission>,
}

impl Caller {
    pub fn new(name: &str, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            name: name.to_string(),
            permissions: permissions.into_iter().collect(),
        }
    }

    /// The engine itself, holding every permission.
    pub fn system() -> Self {
        Self::new("system", Permission::ALL)
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Create,
    Start,
    Pause,
    Resume,
    Stop,
    TriggerNextGroup,
    Delete,
}

impl Operation {
    pub fn required_permission(self) -> Permission {
        match self {
            Operation::Read => Permission::ReadRollout,
            Operation::Create => Permission::CreateRollout,
            Operation::Start
            | Operation::Pause
            | Operation::Resume
            | Operation::Stop
            | Operation::TriggerNextGroup => Permission::HandleRollout,
            Operation::Delete => Permission::DeleteRollout,
        }
    }
}

/// Pre-call authorization hook.
pub trait AccessPolicy: Send + Sync {
    fn authorize(
        &self,
        caller: &Caller,
        operation: Operation,
        rollout: Option<RolloutId>,
    ) -> RolloutResult<()>;
}

/// Grants everything. Used by the daemon when no policy is configured and in tests.
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn authorize(&self, _: &Caller, _: Operation, _: Option<RolloutId>) -> RolloutResult<()> {
        Ok(())
    }
}

/// Requires the caller to hold the permission mapped to the operation.
pub struct PermissionPolicy;

impl AccessPolicy for PermissionPolicy {
    fn authorize(
        &self,
        caller: &Caller,
        operation: Operation,
        rollout: Option<RolloutId>,
    ) -> RolloutResult<()> {
        let needed = operation.required_permission();
        if caller.has(needed) {
            return Ok(());
        }
        let subject = rollout
            .map(|id| format!(" on rollout {id}"))
            .unwrap_or_default();
        Err(RolloutError::Forbidden(format!(
            "{} lacks {needed:?} for {operation:?}{subject}",
            caller.name
        )))
    }
}
