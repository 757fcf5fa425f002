//! Per-rollout leases.
//!
//! A lease row guarantees that at most one scheduler worker drives a given
//! rollout at a time. The redb file is locked by the process that opened it,
//! so leases arbitrate between workers of one daemon, never between nodes.
//! Leases expire so that a worker that died mid-tick never blocks a rollout
//! forever.

use std::time::Duration;

use tracing::debug;

use crate::error::StateResult;
use crate::store::{StateStore, get_json};
use crate::tables::{LEASES, id_key};
use crate::types::{Lease, RolloutId, epoch_millis};

impl StateStore {
    /// Try to take the lease of `rollout_id` for `owner`.
    ///
    /// Succeeds if no lease exists, the existing one has expired, or `owner`
    /// already holds it (the expiry is then extended). Returns `false` if
    /// another owner holds a live lease.
    pub fn try_acquire_lease(
        &self,
        rollout_id: RolloutId,
        owner: &str,
        ttl: Duration,
    ) -> StateResult<bool> {
        let now = epoch_millis();
        let acquired = self.write(|txn| {
            if let Some(existing) = txn.get_lease(rollout_id)?
                && existing.owner != owner
                && existing.expires_at_ms > now
            {
                return Ok(false);
            }
            txn.put_lease(&Lease {
                rollout_id,
                owner: owner.to_string(),
                expires_at_ms: now
                    .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
            })?;
            Ok::<_, crate::StateError>(true)
        })?;
        if acquired {
            debug!(rollout = rollout_id, owner, "lease acquired");
        }
        Ok(acquired)
    }

    /// Release a lease held by `owner`. Leases of other owners are left alone.
    pub fn release_lease(&self, rollout_id: RolloutId, owner: &str) -> StateResult<bool> {
        self.write(|txn| match txn.get_lease(rollout_id)? {
            Some(lease) if lease.owner == owner => txn.remove_lease(rollout_id),
            _ => Ok(false),
        })
    }

    pub fn get_lease(&self, rollout_id: RolloutId) -> StateResult<Option<Lease>> {
        self.read_table(LEASES, |t| get_json(t, &id_key(rollout_id)))
    }
}
