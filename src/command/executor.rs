//! Dispatches a decoded [`CommandFrame`] against the hub and answers with
//! an ack (if requested) followed by a `command_result`, both pushed
//! through the same outbound channel the cloud session reads from — this
//! is what guarantees the ack is always written before the result.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::fullsync::FullSyncCollector;
use crate::hub::HubSession;
use crate::protocol::{BridgeToCloud, CommandFrame, CommandResultError, CommandResultFrame, CommandStatus, CommandType};

#[derive(Clone)]
pub struct CommandExecutor {
    hub: Arc<HubSession>,
    fullsync: FullSyncCollector,
    outbox: mpsc::UnboundedSender<BridgeToCloud>,
}

impl CommandExecutor {
    pub fn new(hub: Arc<HubSession>, outbox: mpsc::UnboundedSender<BridgeToCloud>) -> Self {
        let fullsync = FullSyncCollector::new(Arc::clone(&hub));
        Self { hub, fullsync, outbox }
    }

    pub async fn handle(&self, cmd: CommandFrame) {
        if cmd.requires_ack {
            let _ = self.outbox.send(BridgeToCloud::command_ack(cmd.cmd_id.clone(), Utc::now()));
        }

        if let Some(ttl_ms) = cmd.ttl_ms {
            let deadline = cmd.issued_at + chrono::Duration::milliseconds(ttl_ms as i64);
            if Utc::now() > deadline {
                self.send_result(&cmd.cmd_id, CommandStatus::Expired, None, None);
                return;
            }
        }

        match cmd.command_type {
            CommandType::HaCallService => self.handle_call_service(&cmd).await,
            CommandType::HaFullResync => self.handle_full_resync(&cmd).await,
            CommandType::HaRefreshEntity => self.handle_refresh_entity(&cmd).await,
            CommandType::Unknown => {
                warn!(cmd_id = %cmd.cmd_id, "command: unrecognized command type");
                self.send_result(
                    &cmd.cmd_id,
                    CommandStatus::Failed,
                    None,
                    Some(CommandResultError { code: "UNKNOWN_COMMAND", message: "unrecognized command type".into() }),
                );
            }
        }
    }

    async fn handle_call_service(&self, cmd: &CommandFrame) {
        let domain = cmd.payload.get("domain").and_then(Value::as_str);
        let service = cmd.payload.get("service").and_then(Value::as_str);
        let (domain, service) = match (domain, service) {
            (Some(d), Some(s)) => (d, s),
            _ => {
                self.send_result(
                    &cmd.cmd_id,
                    CommandStatus::Failed,
                    None,
                    Some(CommandResultError { code: "INVALID_PAYLOAD", message: "payload missing domain/service".into() }),
                );
                return;
            }
        };
        let service_data = cmd.payload.get("serviceData").cloned().unwrap_or_else(|| json!({}));

        match self.hub.call_service(domain, service, service_data).await {
            Ok(result) => self.send_result(&cmd.cmd_id, CommandStatus::Completed, Some(json!({"haResponse": result})), None),
            Err(e) => self.send_result(
                &cmd.cmd_id,
                CommandStatus::Failed,
                None,
                Some(CommandResultError { code: "EXECUTION_FAILED", message: e.to_string() }),
            ),
        }
    }

    async fn handle_full_resync(&self, cmd: &CommandFrame) {
        let frame = self.fullsync.collect_frame().await;
        let _ = self.outbox.send(frame);
        self.send_result(&cmd.cmd_id, CommandStatus::Completed, None, None);
    }

    async fn handle_refresh_entity(&self, cmd: &CommandFrame) {
        let entity_id = match cmd.payload.get("entityId").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                self.send_result(
                    &cmd.cmd_id,
                    CommandStatus::Failed,
                    None,
                    Some(CommandResultError { code: "INVALID_PAYLOAD", message: "payload missing entityId".into() }),
                );
                return;
            }
        };

        match self
            .hub
            .call_service("homeassistant", "update_entity", json!({"entity_id": entity_id}))
            .await
        {
            Ok(result) => self.send_result(&cmd.cmd_id, CommandStatus::Completed, Some(result), None),
            Err(e) => self.send_result(
                &cmd.cmd_id,
                CommandStatus::Failed,
                None,
                Some(CommandResultError { code: "EXECUTION_FAILED", message: e.to_string() }),
            ),
        }
    }

    fn send_result(&self, cmd_id: &str, status: CommandStatus, result: Option<Value>, error: Option<CommandResultError>) {
        let frame = BridgeToCloud::CommandResult(CommandResultFrame {
            cmd_id: cmd_id.to_string(),
            status,
            result,
            error,
        });
        let _ = self.outbox.send(frame);
    }
}
