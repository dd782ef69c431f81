//! Bridge orchestrator — constructs every component and wires their
//! events together: hub state changes feed the batcher, cloud
//! authentication gates the batcher, and cloud commands/full-sync
//! requests are dispatched to their handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cloud::{CloudEvent, CloudSession};
use crate::command::CommandExecutor;
use crate::config::BridgeConfig;
use crate::credential::CredentialStore;
use crate::fullsync::FullSyncCollector;
use crate::hub::{HubEvent, HubSession};
use crate::pairing::PairingCoordinator;
use crate::state::StateBatcher;

/// How long startup waits for the hub to authenticate before declaring it
/// unreachable and aborting.
const HUB_REACHABILITY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BridgeOrchestrator {
    config: BridgeConfig,
    credentials: Arc<CredentialStore>,
    hub: Arc<HubSession>,
    cloud: Arc<CloudSession>,
    batcher: Arc<StateBatcher>,
    executor: CommandExecutor,
    fullsync: FullSyncCollector,
    pairing: PairingCoordinator,
}

impl BridgeOrchestrator {
    pub async fn new(config: BridgeConfig) -> Self {
        let credentials = CredentialStore::open(&config.credential_path).await;
        let hub = HubSession::new(&config);
        let cloud = CloudSession::new(&config, Arc::clone(&credentials));
        let batcher = StateBatcher::new(cloud.outbox());
        let fullsync = FullSyncCollector::new(Arc::clone(&hub));
        let executor = CommandExecutor::new(Arc::clone(&hub), cloud.outbox());
        let pairing = PairingCoordinator::new(&config, Arc::clone(&credentials));

        Self { config, credentials, hub, cloud, batcher, executor, fullsync, pairing }
    }

    /// Runs the bridge until a shutdown signal is received. Pairing blocks
    /// startup; every other component runs concurrently afterward.
    pub async fn run(self) -> anyhow::Result<()> {
        // Bring the hub session up first and fail fast (non-zero exit) if
        // it never becomes reachable.
        let hub_run = tokio::spawn(Arc::clone(&self.hub).run());
        self.wait_for_hub_reachable().await?;
        let hub_version = self.load_initial_hub_snapshot().await;

        if !self.credentials.is_paired().await {
            if let Err(e) = self.pairing.ensure_paired(hub_version.as_deref()).await {
                warn!(error = %e, "orchestrator: pairing did not complete; bridge will idle unpaired");
            }
        } else {
            info!("orchestrator: credential already present, connecting to cloud directly");
        }

        let health = tokio::spawn(crate::health::serve(
            self.config.health_port,
            Arc::clone(&self.credentials),
            Arc::clone(&self.cloud),
        ));
        let cloud_run = tokio::spawn(Arc::clone(&self.cloud).run());
        let batcher_run = tokio::spawn(Arc::clone(&self.batcher).run());
        let wiring = tokio::spawn(wire_events(
            Arc::clone(&self.hub),
            Arc::clone(&self.cloud),
            Arc::clone(&self.batcher),
            self.executor.clone(),
            self.fullsync.clone(),
        ));

        wait_for_shutdown_signal().await;
        info!("orchestrator: shutdown signal received, stopping");

        self.batcher.flush().await;
        self.hub.disconnect().await;
        self.cloud.disconnect().await;

        wiring.abort();
        health.abort();
        hub_run.abort();
        cloud_run.abort();
        batcher_run.abort();
        Ok(())
    }

    /// Verifies hub reachability before doing anything else. The hub
    /// session's own `run()` loop is already attempting to connect; here we
    /// just wait for it to either authenticate or fail in a way that's
    /// fatal for the whole process — hub-unreachable is a fatal startup
    /// error, unlike ordinary mid-run disconnects.
    async fn wait_for_hub_reachable(&self) -> Result<()> {
        let mut events = self.hub.subscribe_events();
        let outcome = tokio::time::timeout(HUB_REACHABILITY_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(HubEvent::Authenticated) => return Ok(()),
                    Ok(HubEvent::AuthFailed) => bail!("hub rejected the configured access token"),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => bail!("hub session closed before authenticating"),
                }
            }
        })
        .await;

        match outcome {
            Ok(inner) => inner,
            Err(_) => bail!("hub unreachable: no response within {HUB_REACHABILITY_TIMEOUT:?}"),
        }
    }

    /// Caches the hub version and loads the entity registry and initial
    /// states. Both are non-fatal — a failure here leaves the entity count
    /// at zero and the sync will be retried the next time the cloud
    /// requests one. Returns the cached hub version so it can be threaded
    /// into the pairing request's `haVersion` field.
    async fn load_initial_hub_snapshot(&self) -> Option<String> {
        self.cloud.set_hub_connected(true);

        let hub_version = match self.hub.get_config().await {
            Ok(config) => config
                .get("version")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            Err(e) => {
                warn!(error = %e, "orchestrator: getConfig failed, hub version unknown");
                None
            }
        };
        self.cloud.set_hub_version(hub_version.clone()).await;

        match self.hub.get_states().await {
            Ok(serde_json::Value::Array(states)) => self.cloud.set_entity_count(states.len()),
            Ok(_) => self.cloud.set_entity_count(0),
            Err(e) => {
                warn!(error = %e, "orchestrator: initial get_states failed, entity count stays at zero");
                self.cloud.set_entity_count(0);
            }
        }
        if let Err(e) = self.hub.get_entities().await {
            warn!(error = %e, "orchestrator: initial entity registry load failed");
        }

        hub_version
    }
}

async fn wire_events(
    hub: Arc<HubSession>,
    cloud: Arc<CloudSession>,
    batcher: Arc<StateBatcher>,
    executor: CommandExecutor,
    fullsync: FullSyncCollector,
) {
    let mut hub_events = hub.subscribe_events();
    let mut cloud_events = cloud.subscribe_events();

    loop {
        tokio::select! {
            event = hub_events.recv() => {
                match event {
                    Ok(HubEvent::Authenticated) => cloud.set_hub_connected(true),
                    Ok(HubEvent::Disconnected) => cloud.set_hub_connected(false),
                    Ok(HubEvent::StateChanged(change)) => {
                        cloud.note_state_event(change.timestamp).await;
                        batcher.ingest(change).await;
                    }
                    Ok(HubEvent::AuthFailed) | Ok(HubEvent::Error(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            event = cloud_events.recv() => {
                match event {
                    Ok(CloudEvent::Authenticated) => batcher.set_authenticated(true),
                    Ok(CloudEvent::Disconnected) | Ok(CloudEvent::AuthFailed) => batcher.set_authenticated(false),
                    Ok(CloudEvent::Command(cmd)) => {
                        let executor = executor.clone();
                        tokio::spawn(async move { executor.handle(cmd).await; });
                    }
                    Ok(CloudEvent::RequestFullSync) => {
                        let fullsync = fullsync.clone();
                        let cloud = Arc::clone(&cloud);
                        tokio::spawn(async move {
                            let frame = fullsync.collect_frame().await;
                            let _ = cloud.outbox().send(frame);
                        });
                    }
                    Ok(CloudEvent::Connected) | Ok(CloudEvent::Error(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Waits for Ctrl-C, or on unix also SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
