//! Group membership: partitions a rollout's population into its groups.
//!
//! Each group takes `target_percentage` percent (rounded half-up) of the
//! targets that match its effective filter and are not in an earlier group.
//! The same rule drives the dry run at creation time and the persisted build
//! while the rollout is `CREATING`, so both produce the same partition.

use fleetgrid_core::TargetFilter;
use fleetgrid_state::{GroupStatus, Rollout, RolloutGroup, RolloutStatus, StateStore, Target};
use std::collections::HashSet;
use tracing::debug;

use crate::error::{RolloutError, RolloutResult};
use crate::strategy::ResolvedGroup;

/// Number of candidates a group with `percentage` takes.
pub fn take_count(percentage: f64, candidates: usize) -> usize {
    let exact = percentage * candidates as f64 / 100.0;
    (exact.round() as usize).min(candidates)
}

/// Outcome of a creation-time dry run.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionPlan {
    /// Targets per group, in group order.
    pub group_sizes: Vec<usize>,
    /// Matching targets left outside every group.
    pub unassigned: usize,
}

impl PartitionPlan {
    pub fn assigned(&self) -> usize {
        self.group_sizes.iter().sum()
    }
}

/// Simulate the partition of `population` into `groups`.
pub fn plan_partition(
    population: &[Target],
    base: &TargetFilter,
    groups: &[ResolvedGroup],
) -> RolloutResult<PartitionPlan> {
    let mut taken: HashSet<&str> = HashSet::new();
    let mut group_sizes = Vec::with_capacity(groups.len());
    for group in groups {
        let filter = group.effective_filter(base)?;
        let candidates: Vec<&Target> = population
            .iter()
            .filter(|t| !taken.contains(t.controller_id.as_str()) && filter.matches(*t))
            .collect();
        let take = take_count(group.target_percentage, candidates.len());
        for t in candidates.into_iter().take(take) {
            taken.insert(t.controller_id.as_str());
        }
        group_sizes.push(take);
    }
    Ok(PartitionPlan {
        group_sizes,
        unassigned: population.len() - taken.len(),
    })
}

/// Persists group membership for rollouts in `CREATING`.
#[derive(Clone)]
pub struct GroupBuilder {
    store: StateStore,
}

impl GroupBuilder {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Fill one group in its own write transaction and move it to `SCHEDULED`.
    ///
    /// A group that already left `CREATING` is left untouched, and targets
    /// already assigned to another group of the rollout are skipped, so the
    /// build can be re-run after a crash at any point.
    pub fn fill_group(&self, rollout: &Rollout, group: &RolloutGroup) -> RolloutResult<u64> {
        let base = TargetFilter::parse(&rollout.target_filter)?;
        let filter = match &group.target_filter {
            Some(refinement) => base.and(&TargetFilter::parse(refinement)?),
            None => base,
        };

        let (taken, filled) = self.store.write(|txn| {
            let current = txn.require_rollout(rollout.id)?;
            if current.status != RolloutStatus::Creating {
                return Err(RolloutError::StateConflict(format!(
                    "rollout {} is {:?}, no longer building groups",
                    rollout.id, current.status
                )));
            }
            let mut group = txn.require_group(group.id)?;
            if group.status != GroupStatus::Creating {
                return Ok((group.total_targets, false));
            }

            let mut candidates = Vec::new();
            for target in txn.query_targets(&filter, Some(rollout.created_at))? {
                if txn.assigned_group(rollout.id, &target.controller_id)?.is_none() {
                    candidates.push(target.controller_id);
                }
            }
            let take = take_count(group.target_percentage, candidates.len());
            for id in candidates.iter().take(take) {
                txn.assign_target(rollout.id, group.id, id)?;
            }

            group.total_targets = take as u64;
            group.status = GroupStatus::Scheduled;
            group.updated_at = fleetgrid_state::epoch_millis();
            txn.put_group(&group)?;
            Ok((group.total_targets, true))
        })?;

        if filled {
            debug!(
                rollout = rollout.id,
                group = group.id,
                targets = taken,
                "group membership built"
            );
        }
        Ok(taken)
    }
}
