//! Scheduler — periodic processing of active rollouts.
//!
//! The `RolloutScheduler` is the control loop that:
//! - Lists rollouts in `CREATING`, `READY`, `STARTING` or `RUNNING`
//! - Takes each rollout's lease so no two workers drive it at once
//! - Runs the controller step on a bounded pool of blocking workers
//! - Isolates failures: one broken rollout never stops the others

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fleetgrid_core::SchedulerConfig;
use fleetgrid_rollout::{ProcessOutcome, RolloutController, RolloutError};
use fleetgrid_state::{RolloutId, RolloutStatus, StateStore};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// Tick counter shared by every scheduler in the process, so that lease
/// owners of concurrent ticks never collide.
static TICK_SEQ: AtomicU64 = AtomicU64::new(0);

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Rollouts the controller ran for.
    pub processed: usize,
    /// Of those, rollouts where a transition was committed.
    pub advanced: usize,
    /// Rollouts whose lease was held by another worker.
    pub skipped: usize,
    pub failed: usize,
}

enum Step {
    Skipped,
    Processed(ProcessOutcome),
}

pub struct RolloutScheduler {
    store: StateStore,
    controller: Arc<RolloutController>,
    node_id: String,
    lease_ttl: Duration,
    max_parallel: usize,
}

impl RolloutScheduler {
    pub fn new(
        store: StateStore,
        controller: Arc<RolloutController>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            controller,
            node_id: config.node_id.clone(),
            lease_ttl: Duration::from_secs(config.lease_ttl_secs),
            max_parallel: config.max_parallel.max(1),
        }
    }

    /// Process every active rollout once.
    pub async fn tick(&self) -> SchedulerResult<TickReport> {
        let seq = TICK_SEQ.fetch_add(1, Ordering::Relaxed);
        let owner = format!("{}/{seq}", self.node_id);
        let rollouts = self.store.list_rollouts_in(&RolloutStatus::ACTIVE)?;
        let mut report = TickReport::default();
        if rollouts.is_empty() {
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(self.max_parallel));
        let mut workers = JoinSet::new();
        for rollout in rollouts {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SchedulerError::WorkerPool(e.to_string()))?;
            let store = self.store.clone();
            let controller = self.controller.clone();
            let owner = owner.clone();
            let ttl = self.lease_ttl;
            workers.spawn_blocking(move || {
                let _permit = permit;
                let result = step(&store, &controller, rollout.id, &owner, ttl);
                (rollout.id, result)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(Step::Skipped))) => report.skipped += 1,
                Ok((_, Ok(Step::Processed(outcome)))) => {
                    report.processed += 1;
                    if outcome == ProcessOutcome::Advanced {
                        report.advanced += 1;
                    }
                }
                Ok((rollout, Err(e))) => {
                    report.failed += 1;
                    if e.is_transient() {
                        warn!(rollout, error = %e, "rollout step failed, retrying next tick");
                    } else {
                        error!(rollout, error = %e, "rollout step failed");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "rollout worker panicked");
                }
            }
        }

        debug!(
            owner = %owner,
            processed = report.processed,
            advanced = report.advanced,
            skipped = report.skipped,
            failed = report.failed,
            "scheduler tick complete"
        );
        Ok(report)
    }

    /// Run ticks every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            node = %self.node_id,
            max_parallel = self.max_parallel,
            "rollout scheduler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("rollout scheduler shutting down");
                    break;
                }
            }
        }
    }
}

/// One lease-guarded controller step. Blocking.
fn step(
    store: &StateStore,
    controller: &RolloutController,
    rollout: RolloutId,
    owner: &str,
    ttl: Duration,
) -> Result<Step, RolloutError> {
    if !store.try_acquire_lease(rollout, owner, ttl)? {
        debug!(rollout, owner, "rollout leased elsewhere, skipped");
        return Ok(Step::Skipped);
    }
    let result = controller.process(rollout);
    if let Err(e) = store.release_lease(rollout, owner) {
        // expires on its own after the ttl
        warn!(rollout, error = %e, "failed to release rollout lease");
    }
    result.map(Step::Processed)
}
