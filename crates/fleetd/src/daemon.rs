//! Daemon assembly — wires the store, the rollout engine, the scheduler and
//! the REST API together.
//!
//! In `run` mode, the daemon:
//! 1. Opens the redb state store under the configured data directory
//! 2. Builds the rollout controller and the management API on top of it
//! 3. Runs the rollout scheduler loop in the background
//! 4. Serves the REST API until Ctrl-C, then stops the scheduler
//!
//! Rollout events go both to the log and to the `/api/v1/events` stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleetgrid_core::FleetConfig;
use fleetgrid_rollout::{
    AccessPolicy, AllowAll, BroadcastSink, EventSink, LogSink, MultiSink, PermissionPolicy,
    RolloutController, RolloutManagement,
};
use fleetgrid_scheduler::{RolloutScheduler, TickReport};
use fleetgrid_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info};

/// Events buffered per `/events` subscriber before it starts lagging.
const EVENT_BUFFER: usize = 1024;

pub struct Daemon {
    config: FleetConfig,
    store: StateStore,
    management: Arc<RolloutManagement>,
    scheduler: Arc<RolloutScheduler>,
    events: BroadcastSink,
}

impl Daemon {
    /// Open the store and build every subsystem.
    pub fn open(config: FleetConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.store.data_dir)?;
        let db_path = config.store.db_path();
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: FleetConfig, store: StateStore) -> Self {
        let broadcast = BroadcastSink::new(EVENT_BUFFER);
        let events: Arc<dyn EventSink> = Arc::new(MultiSink(vec![
            Arc::new(LogSink),
            Arc::new(broadcast.clone()),
        ]));
        let policy: Arc<dyn AccessPolicy> = if config.api.enforce_permissions {
            Arc::new(PermissionPolicy)
        } else {
            Arc::new(AllowAll)
        };

        let controller = Arc::new(RolloutController::new(
            store.clone(),
            &config.engine,
            events.clone(),
        ));
        let management = Arc::new(RolloutManagement::new(
            store.clone(),
            config.engine.clone(),
            policy,
            events,
        ));
        let scheduler = Arc::new(RolloutScheduler::new(
            store.clone(),
            controller,
            &config.scheduler,
        ));
        info!(
            node = %config.scheduler.node_id,
            enforce_permissions = config.api.enforce_permissions,
            "rollout engine initialized"
        );

        Self {
            config,
            store,
            management,
            scheduler,
            events: broadcast,
        }
    }

    pub fn router(&self) -> axum::Router {
        fleetgrid_api::build_router(
            self.store.clone(),
            self.management.clone(),
            self.events.clone(),
        )
    }

    /// Run a single scheduler tick, for cron-driven deployments.
    pub async fn tick(&self) -> anyhow::Result<TickReport> {
        Ok(self.scheduler.tick().await?)
    }

    /// Serve the API and run the scheduler until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let interval = Duration::from_secs(self.config.scheduler.interval_secs);
        let scheduler = self.scheduler.clone();
        let scheduler_handle = tokio::spawn(async move {
            scheduler.run(interval, shutdown_rx).await;
        });

        let router = self.router();
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.api.port));
        info!(%addr, "API server starting");
        let listener = tokio::net::TcpListener::bind(addr).await?;

        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for CTRL+C");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        server.await?;

        let _ = scheduler_handle.await;
        info!("fleetd stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use fleetgrid_rollout::{Caller, CreateRolloutRequest, GroupingSpec, RolloutEvent};
    use fleetgrid_state::GroupConditions;

    #[test]
    fn management_events_reach_the_stream() {
        let store = StateStore::open_in_memory().unwrap();
        let daemon = Daemon::with_store(FleetConfig::default(), store.clone());
        let mut rx = daemon.events.subscribe();

        store.register_target("dev-1", "dev-1", BTreeMap::new()).unwrap();
        let dist = store
            .create_distribution("fw", "1.0", vec!["os".into()])
            .unwrap();
        let rollout = daemon
            .management
            .create_rollout(
                &Caller::system(),
                CreateRolloutRequest {
                    name: "r1".into(),
                    description: None,
                    distribution_id: dist.id,
                    target_filter: "id==dev-*".into(),
                    action_type: Default::default(),
                    forced_time: None,
                    grouping: GroupingSpec::Equal { groups: 1 },
                    default_conditions: GroupConditions::default(),
                },
            )
            .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            RolloutEvent::Created {
                rollout: rollout.id,
                name: "r1".into(),
                groups: 1,
            }
        );
    }
}
