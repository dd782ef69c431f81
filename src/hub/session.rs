//! Hub session manager.
//!
//! Maintains an `AtomicU64` request-id counter plus a waiters map keyed by
//! that id for JSON-RPC-style dispatch to the hub, and a
//! connect/split/read-loop/reconnect shape that tracks hub authentication
//! explicitly as a state machine rather than a single always-on tunnel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::BridgeConfig;
use crate::error::HubRpcError;
use crate::protocol::StateChangeEvent;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_START_MS: u64 = 1_000;
const RECONNECT_CAP_MS: u64 = 30_000;
const RECONNECT_MAX_ATTEMPTS: u32 = 10;
const EVENTS_CHANNEL_CAPACITY: usize = 64;

/// Events the hub session publishes for the rest of the bridge to react to.
#[derive(Debug, Clone)]
pub enum HubEvent {
    Authenticated,
    Disconnected,
    StateChanged(StateChangeEvent),
    AuthFailed,
    Error(String),
}

/// An authenticated WebSocket client to the local hub, doubling as an RPC
/// multiplexer. One instance lives for the life of the process; `run`
/// drives its own reconnect loop and never returns until `disconnect` is
/// called or the attempt budget is exhausted.
pub struct HubSession {
    hub_url: String,
    hub_token: String,
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<Result<Value, HubRpcError>>>>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events_tx: broadcast::Sender<HubEvent>,
    should_reconnect: AtomicBool,
    shutdown: Notify,
}

impl HubSession {
    pub fn new(config: &BridgeConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
        Arc::new(Self {
            hub_url: config.hub_url.clone(),
            hub_token: config.hub_token.clone(),
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
            outbound_tx: Mutex::new(None),
            events_tx,
            should_reconnect: AtomicBool::new(true),
            shutdown: Notify::new(),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.events_tx.subscribe()
    }

    /// Drives connect → authenticate → subscribe → read, reconnecting with
    /// backoff (10 attempts, 1s→30s doubling) on every disconnect, until
    /// `disconnect()` is called or the attempt budget runs out.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new(RECONNECT_START_MS, RECONNECT_CAP_MS, RECONNECT_MAX_ATTEMPTS);
        loop {
            if !self.should_reconnect.load(Ordering::SeqCst) {
                return;
            }
            match self.connect_once().await {
                Ok(()) => backoff.reset(),
                Err(e) => warn!(error = %e, "hub: connection attempt failed"),
            }
            if !self.should_reconnect.load(Ordering::SeqCst) {
                return;
            }
            if backoff.exhausted() {
                warn!(attempts = backoff.attempt(), "hub: giving up after repeated failures");
                return;
            }
            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "hub: reconnecting after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => return,
            }
        }
    }

    async fn connect_once(self: &Arc<Self>) -> Result<()> {
        let ws_url = hub_ws_url(&self.hub_url);
        info!(url = %ws_url, "hub: connecting");
        let (stream, _) = connect_async(&ws_url).await.context("hub connect failed")?;
        let (sink, mut read) = stream.split();

        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound_tx.lock().await = Some(tx.clone());
        let writer = tokio::spawn(write_loop(rx, sink));

        let result = self.read_loop(&mut read, &tx).await;

        *self.outbound_tx.lock().await = None;
        self.fail_all_waiters(HubRpcError::Disconnected).await;
        let _ = self.events_tx.send(HubEvent::Disconnected);
        writer.abort();
        result
    }

    async fn read_loop(
        self: &Arc<Self>,
        read: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
        tx: &mpsc::UnboundedSender<Message>,
    ) -> Result<()> {
        while let Some(msg) = read.next().await {
            let msg = msg.context("hub socket read error")?;
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };

            match parse_inbound_hub_frame(&text) {
                HubInboundFrame::AuthRequired => {
                    let frame = json!({"type": "auth", "access_token": self.hub_token});
                    if tx.send(Message::Text(frame.to_string())).is_err() {
                        break;
                    }
                }
                HubInboundFrame::AuthOk => {
                    info!("hub: authenticated");
                    let _ = self.events_tx.send(HubEvent::Authenticated);
                    let me = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = me.subscribe_state_changed().await {
                            warn!(error = %e, "hub: failed to subscribe to state_changed events");
                        }
                    });
                }
                HubInboundFrame::AuthInvalid => {
                    warn!("hub: authentication rejected");
                    let _ = self.events_tx.send(HubEvent::AuthFailed);
                    self.should_reconnect.store(false, Ordering::SeqCst);
                    break;
                }
                HubInboundFrame::Result { id, outcome } => {
                    if let Some(waiter) = self.waiters.lock().await.remove(&id) {
                        let _ = waiter.send(outcome);
                    }
                }
                HubInboundFrame::StateChanged(event) => {
                    let _ = self.events_tx.send(HubEvent::StateChanged(event));
                }
                HubInboundFrame::Ignored => {}
                HubInboundFrame::Malformed => {
                    debug!(raw = %text, "hub: ignoring malformed frame");
                }
            }
        }
        Ok(())
    }

    async fn fail_all_waiters(&self, err: HubRpcError) {
        let mut waiters = self.waiters.lock().await;
        for (_, waiter) in waiters.drain() {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    /// Issue one request/response RPC and wait up to [`RPC_TIMEOUT`] for the
    /// matching `result` frame.
    pub async fn send_command(&self, type_: &str, data: Value) -> Result<Value, HubRpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (done_tx, done_rx) = oneshot::channel();
        self.waiters.lock().await.insert(id, done_tx);

        let frame = build_request_frame(id, type_, data);
        let sent = {
            let guard = self.outbound_tx.lock().await;
            match guard.as_ref() {
                Some(tx) => tx.send(Message::Text(frame.to_string())).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.waiters.lock().await.remove(&id);
            return Err(HubRpcError::Disconnected);
        }

        match tokio::time::timeout(RPC_TIMEOUT, done_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(HubRpcError::Disconnected),
            Err(_) => {
                self.waiters.lock().await.remove(&id);
                Err(HubRpcError::Timeout)
            }
        }
    }

    async fn subscribe_state_changed(&self) -> Result<Value, HubRpcError> {
        self.send_command("subscribe_events", json!({"event_type": "state_changed"}))
            .await
    }

    pub async fn get_config(&self) -> Result<Value, HubRpcError> {
        self.send_command("get_config", json!({})).await
    }

    pub async fn get_areas(&self) -> Result<Value, HubRpcError> {
        self.send_command("config/area_registry/list", json!({})).await
    }

    pub async fn get_devices(&self) -> Result<Value, HubRpcError> {
        self.send_command("config/device_registry/list", json!({})).await
    }

    pub async fn get_entities(&self) -> Result<Value, HubRpcError> {
        self.send_command("config/entity_registry/list", json!({})).await
    }

    pub async fn get_states(&self) -> Result<Value, HubRpcError> {
        self.send_command("get_states", json!({})).await
    }

    pub async fn get_services(&self) -> Result<Value, HubRpcError> {
        self.send_command("get_services", json!({})).await
    }

    pub async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<Value, HubRpcError> {
        self.send_command(
            "call_service",
            json!({"domain": domain, "service": service, "service_data": data}),
        )
        .await
    }

    /// Stop reconnecting and close the active connection, if any. Outstanding
    /// RPCs fail with [`HubRpcError::Disconnected`].
    pub async fn disconnect(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        if let Some(tx) = self.outbound_tx.lock().await.take() {
            let _ = tx.send(Message::Close(None));
        }
        self.fail_all_waiters(HubRpcError::Disconnected).await;
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

fn build_request_frame(id: u64, type_: &str, data: Value) -> Value {
    let mut obj = match data {
        Value::Object(m) => m,
        _ => Map::new(),
    };
    obj.insert("id".to_string(), json!(id));
    obj.insert("type".to_string(), json!(type_));
    Value::Object(obj)
}

#[derive(Debug)]
enum HubInboundFrame {
    AuthRequired,
    AuthOk,
    AuthInvalid,
    Result { id: u64, outcome: Result<Value, HubRpcError> },
    StateChanged(StateChangeEvent),
    Ignored,
    Malformed,
}

fn parse_inbound_hub_frame(text: &str) -> HubInboundFrame {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return HubInboundFrame::Malformed,
    };
    let ty = match value.get("type").and_then(Value::as_str) {
        Some(t) => t,
        None => return HubInboundFrame::Malformed,
    };

    match ty {
        "auth_required" => HubInboundFrame::AuthRequired,
        "auth_ok" => HubInboundFrame::AuthOk,
        "auth_invalid" => HubInboundFrame::AuthInvalid,
        "result" => {
            let id = match value.get("id").and_then(Value::as_u64) {
                Some(id) => id,
                None => return HubInboundFrame::Malformed,
            };
            let success = value.get("success").and_then(Value::as_bool).unwrap_or(false);
            let outcome = if success {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            } else {
                let message = value
                    .get("error")
                    .map(|e| match e {
                        Value::String(s) => s.clone(),
                        other => other
                            .get("message")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| other.to_string()),
                    })
                    .unwrap_or_else(|| "unknown hub error".to_string());
                Err(HubRpcError::Remote(message))
            };
            HubInboundFrame::Result { id, outcome }
        }
        "event" => {
            let event_type = value
                .get("event")
                .and_then(|e| e.get("event_type"))
                .and_then(Value::as_str);
            if event_type != Some("state_changed") {
                return HubInboundFrame::Ignored;
            }
            let data = value.get("event").and_then(|e| e.get("data")).cloned().unwrap_or(Value::Null);
            match serde_json::from_value::<StateChangeEvent>(data) {
                Ok(event) => HubInboundFrame::StateChanged(event),
                Err(_) => HubInboundFrame::Malformed,
            }
        }
        _ => HubInboundFrame::Ignored,
    }
}

/// Translate a configured hub base URL into a WebSocket endpoint. Hub URLs
/// that mention `supervisor/core` use the Supervisor proxy's `/websocket`
/// path; anything else uses `/api/websocket`. A trailing slash is tolerated.
fn hub_ws_url(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    let ws = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_string()
    };
    if ws.contains("supervisor/core") {
        format!("{ws}/websocket")
    } else {
        format!("{ws}/api/websocket")
    }
}
