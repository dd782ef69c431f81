//! Cloud session manager.
//!
//! One foreground read loop, one background write loop fed by a channel,
//! and a reconnect wrapper around the pair. Handles credential-revocation
//! and owns the single shared outbox that state batches, full syncs,
//! command acks/results, and heartbeats all converge on, guaranteeing
//! FIFO delivery order.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::BridgeConfig;
use crate::credential::CredentialStore;
use crate::protocol::{decode_cloud_to_bridge, BridgeToCloud, CloudToBridge, CommandFrame, HeartbeatFrame};

const RECONNECT_START_MS: u64 = 1_000;
const RECONNECT_CAP_MS: u64 = 60_000;
const RECONNECT_MAX_ATTEMPTS: u32 = 10;
const UNPAIRED_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum CloudEvent {
    Connected,
    Authenticated,
    AuthFailed,
    Disconnected,
    Command(CommandFrame),
    RequestFullSync,
    Error(String),
}

pub struct CloudSession {
    cloud_url: String,
    bridge_id: String,
    protocol_version: u32,
    heartbeat_interval: Duration,
    credentials: Arc<CredentialStore>,
    events_tx: broadcast::Sender<CloudEvent>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    outbox_tx: mpsc::UnboundedSender<BridgeToCloud>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<BridgeToCloud>>>,
    authenticated: AtomicBool,
    should_reconnect: AtomicBool,
    shutdown: Notify,
    started_at: Instant,
    reconnect_count: AtomicU64,
    hub_connected: AtomicBool,
    hub_version: Mutex<Option<String>>,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
    entity_count: AtomicUsize,
}

impl CloudSession {
    pub fn new(config: &BridgeConfig, credentials: Arc<CredentialStore>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            cloud_url: config.cloud_url.clone(),
            bridge_id: config.bridge_id.clone(),
            protocol_version: config.protocol_version,
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            credentials,
            events_tx,
            outbound_tx: Mutex::new(None),
            outbox_tx,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            authenticated: AtomicBool::new(false),
            should_reconnect: AtomicBool::new(true),
            shutdown: Notify::new(),
            started_at: Instant::now(),
            reconnect_count: AtomicU64::new(0),
            hub_connected: AtomicBool::new(false),
            hub_version: Mutex::new(None),
            last_event_at: Mutex::new(None),
            entity_count: AtomicUsize::new(0),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CloudEvent> {
        self.events_tx.subscribe()
    }

    /// A clone of the shared outbound sender. State batches, full syncs,
    /// and command acks/results are pushed here by their owning
    /// components and forwarded to the wire in the order they were sent.
    pub fn outbox(&self) -> mpsc::UnboundedSender<BridgeToCloud> {
        self.outbox_tx.clone()
    }

    pub fn set_hub_connected(&self, connected: bool) {
        self.hub_connected.store(connected, Ordering::SeqCst);
    }

    pub async fn set_hub_version(&self, version: Option<String>) {
        *self.hub_version.lock().await = version;
    }

    pub async fn hub_version(&self) -> Option<String> {
        self.hub_version.lock().await.clone()
    }

    pub async fn note_state_event(&self, at: DateTime<Utc>) {
        *self.last_event_at.lock().await = Some(at);
    }

    pub fn set_entity_count(&self, count: usize) {
        self.entity_count.store(count, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn is_hub_connected(&self) -> bool {
        self.hub_connected.load(Ordering::SeqCst)
    }

    /// Drains the shared outbox for the lifetime of the session, the
    /// reconnect loop, and the heartbeat ticker. Does not return until
    /// `disconnect()` or attempt exhaustion.
    pub async fn run(self: Arc<Self>) {
        let outbox_rx = self
            .outbox_rx
            .lock()
            .await
            .take()
            .expect("CloudSession::run called more than once");
        tokio::spawn(Arc::clone(&self).outbox_forwarder(outbox_rx));
        tokio::spawn(Arc::clone(&self).heartbeat_ticker());

        let mut backoff = Backoff::new(RECONNECT_START_MS, RECONNECT_CAP_MS, RECONNECT_MAX_ATTEMPTS);
        loop {
            if !self.should_reconnect.load(Ordering::SeqCst) {
                return;
            }
            if !self.credentials.is_paired().await {
                tokio::select! {
                    _ = tokio::time::sleep(UNPAIRED_POLL_INTERVAL) => continue,
                    _ = self.shutdown.notified() => return,
                }
            }

            self.reconnect_count.fetch_add(1, Ordering::SeqCst);
            match self.connect_once().await {
                Ok(()) => backoff.reset(),
                Err(e) => warn!(error = %e, "cloud: connection attempt failed"),
            }
            if !self.should_reconnect.load(Ordering::SeqCst) {
                return;
            }
            if backoff.exhausted() {
                warn!(attempts = backoff.attempt(), "cloud: giving up after repeated failures");
                return;
            }
            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "cloud: reconnecting after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => return,
            }
        }
    }

    async fn outbox_forwarder(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<BridgeToCloud>) {
        while let Some(frame) = rx.recv().await {
            let guard = self.outbound_tx.lock().await;
            match guard.as_ref() {
                Some(tx) => {
                    let _ = tx.send(Message::Text(frame.to_json()));
                }
                None => debug!("cloud: dropping outbound frame, socket not connected"),
            }
        }
    }

    async fn heartbeat_ticker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        loop {
            ticker.tick().await;
            self.send_heartbeat().await;
        }
    }

    async fn send_heartbeat(&self) {
        if !self.authenticated.load(Ordering::SeqCst) {
            return;
        }
        let frame = BridgeToCloud::Heartbeat(HeartbeatFrame {
            bridge_id: self.bridge_id.clone(),
            timestamp: Utc::now(),
            bridge_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: self.protocol_version,
            hub_version: self.hub_version.lock().await.clone(),
            hub_connected: self.hub_connected.load(Ordering::SeqCst),
            cloud_connected: self.authenticated.load(Ordering::SeqCst),
            last_event_at: *self.last_event_at.lock().await,
            entity_count: self.entity_count.load(Ordering::SeqCst),
            reconnect_count: self.reconnect_count.load(Ordering::SeqCst),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        });
        let _ = self.outbox_tx.send(frame);
    }

    async fn connect_once(self: &Arc<Self>) -> Result<()> {
        let credential = self
            .credentials
            .load()
            .await
            .ok_or_else(|| anyhow!("cloud connect attempted while unpaired"))?;

        let ws_url = cloud_ws_url(&self.cloud_url);
        info!(url = %ws_url, "cloud: connecting");
        let (stream, _) = connect_async(&ws_url).await.context("cloud connect failed")?;
        let (sink, mut read) = stream.split();

        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound_tx.lock().await = Some(tx.clone());
        let writer = tokio::spawn(write_loop(rx, sink));
        let _ = self.events_tx.send(CloudEvent::Connected);

        let auth = BridgeToCloud::authenticate(self.bridge_id.clone(), credential.bridge_credential, self.protocol_version);
        if tx.send(Message::Text(auth.to_json())).is_err() {
            writer.abort();
            return Err(anyhow!("cloud: failed to send authenticate frame"));
        }

        let result = self.read_loop(&mut read).await;

        *self.outbound_tx.lock().await = None;
        self.authenticated.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(CloudEvent::Disconnected);
        writer.abort();
        result
    }

    async fn read_loop(
        self: &Arc<Self>,
        read: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    ) -> Result<()> {
        while let Some(msg) = read.next().await {
            let msg = msg.context("cloud socket read error")?;
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };

            let decoded = match decode_cloud_to_bridge(&text) {
                Ok(d) => d,
                Err(e) => {
                    debug!(error = %e, "cloud: ignoring malformed frame");
                    continue;
                }
            };

            match decoded {
                CloudToBridge::AuthResult(result) => {
                    if result.success {
                        self.authenticated.store(true, Ordering::SeqCst);
                        info!(tenant_id = ?result.tenant_id, "cloud: authenticated");
                        let _ = self.events_tx.send(CloudEvent::Authenticated);
                    } else {
                        let message = result.error.unwrap_or_else(|| "authentication rejected".to_string());
                        warn!(reason = %message, "cloud: authentication failed");
                        let _ = self.events_tx.send(CloudEvent::AuthFailed);
                        if is_permanent_auth_failure(&message) {
                            warn!("cloud: credential revoked or invalid, clearing and disabling reconnect");
                            let _ = self.credentials.clear().await;
                            self.should_reconnect.store(false, Ordering::SeqCst);
                        }
                        break;
                    }
                }
                CloudToBridge::Command(cmd) => {
                    let _ = self.events_tx.send(CloudEvent::Command(cmd));
                }
                CloudToBridge::RequestFullSync => {
                    let _ = self.events_tx.send(CloudEvent::RequestFullSync);
                }
                CloudToBridge::RequestHeartbeat => {
                    self.send_heartbeat().await;
                }
                CloudToBridge::RequestLogs => {
                    // No log ring buffer is in scope; answer with an empty
                    // set of lines rather than leaving the request hanging.
                    let _ = self.outbox_tx.send(BridgeToCloud::BridgeLogs(crate::protocol::BridgeLogsFrame { lines: Vec::new() }));
                }
                CloudToBridge::Disconnect(frame) => {
                    let reason = frame.reason.unwrap_or_default();
                    info!(reason = %reason, "cloud: server requested disconnect");
                    if is_user_initiated_disconnect(&reason) {
                        let _ = self.credentials.clear().await;
                        self.should_reconnect.store(false, Ordering::SeqCst);
                    }
                    break;
                }
                CloudToBridge::Unknown(ty) => {
                    debug!(frame_type = %ty, "cloud: ignoring unrecognized frame type");
                }
            }
        }
        Ok(())
    }

    /// Stop reconnecting and close the active connection, if any.
    pub async fn disconnect(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        if let Some(tx) = self.outbound_tx.lock().await.take() {
            let _ = tx.send(Message::Close(None));
        }
    }
}

async fn write_loop(
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut sink: impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
) {
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

fn cloud_ws_url(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    let ws = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_string()
    };
    format!("{ws}/ws/bridge")
}

/// A failed auth whose message mentions revocation or invalidity is
/// permanent — clear the stored credential and stop retrying until the
/// bridge is re-paired.
fn is_permanent_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("revoked") || lower.contains("invalid")
}

fn is_user_initiated_disconnect(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("user_disconnected") || lower.contains("user_reset")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_cloud_url_becomes_wss_ws_bridge_path() {
        assert_eq!(cloud_ws_url("https://helm.replit.app"), "wss://helm.replit.app/ws/bridge");
    }

    #[test]
    fn trailing_slash_is_normalized() {
        assert_eq!(cloud_ws_url("https://helm.replit.app/"), "wss://helm.replit.app/ws/bridge");
    }

    #[test]
    fn revoked_credential_message_is_permanent() {
        assert!(is_permanent_auth_failure("Credential revoked"));
        assert!(is_permanent_auth_failure("credential is invalid"));
        assert!(!is_permanent_auth_failure("tenant temporarily unavailable"));
    }

    #[test]
    fn user_reset_reason_is_recognized_case_insensitively() {
        assert!(is_user_initiated_disconnect("USER_RESET"));
        assert!(is_user_initiated_disconnect("user_disconnected"));
        assert!(!is_user_initiated_disconnect("server_restart"));
    }
}
