//! The bridge↔cloud wire protocol.
//!
//! Every frame is a JSON object with a required string `type` field.
//! Outbound frames (`BridgeToCloud`) are built from typed constructors that
//! cannot produce an invalid shape — we lean on `serde`'s internally tagged
//! enum representation, which serializes each variant's payload fields
//! alongside the `type` discriminant. Inbound frames (`CloudToBridge`) are
//! decoded by hand: the schema validates per declared `type`, and an
//! unrecognized `type` decodes to `Unknown` rather than failing, so an
//! unfamiliar frame is logged and ignored instead of tearing down the
//! connection.

mod state_change;

pub use state_change::{EntityState, StateChangeEvent};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Outbound (bridge → cloud) ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeToCloud {
    Authenticate(AuthenticateFrame),
    Heartbeat(HeartbeatFrame),
    FullSync(FullSyncFrame),
    StateBatch(StateBatchFrame),
    SyncStatus(SyncStatusFrame),
    CommandAck(CommandAckFrame),
    CommandResult(CommandResultFrame),
    Error(ErrorFrame),
    BridgeLogs(BridgeLogsFrame),
}

impl BridgeToCloud {
    /// Serialize to the line-delimited JSON text sent over the socket.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateFrame {
    pub bridge_id: String,
    pub bridge_credential: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatFrame {
    pub bridge_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub bridge_version: String,
    pub protocol_version: u32,
    pub hub_version: Option<String>,
    pub hub_connected: bool,
    pub cloud_connected: bool,
    pub last_event_at: Option<chrono::DateTime<chrono::Utc>>,
    pub entity_count: usize,
    pub reconnect_count: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncFrame {
    pub synced_at: chrono::DateTime<chrono::Utc>,
    pub hub_version: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateBatchFrame {
    pub batch_id: String,
    pub is_overflow: bool,
    pub events: Vec<StateChangeEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusFrame {
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAckFrame {
    pub cmd_id: String,
    pub status: &'static str,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultFrame {
    pub cmd_id: String,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandResultError>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Completed,
    Failed,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultError {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeLogsFrame {
    pub lines: Vec<String>,
}

impl BridgeToCloud {
    pub fn authenticate(bridge_id: String, bridge_credential: String, protocol_version: u32) -> Self {
        Self::Authenticate(AuthenticateFrame {
            bridge_id,
            bridge_credential,
            protocol_version,
        })
    }

    pub fn command_ack(cmd_id: String, received_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self::CommandAck(CommandAckFrame {
            cmd_id,
            status: "acknowledged",
            received_at,
        })
    }
}

// ─── Inbound (cloud → bridge) ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum CloudToBridge {
    AuthResult(AuthResult),
    Command(CommandFrame),
    RequestFullSync,
    RequestHeartbeat,
    Disconnect(DisconnectFrame),
    RequestLogs,
    /// A syntactically valid frame whose `type` is not one we recognize.
    /// Logged and dropped by the caller — never fatal.
    Unknown(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    pub success: bool,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFrame {
    pub cmd_id: String,
    pub tenant_id: String,
    pub issued_at: chrono::DateTime<chrono::Utc>,
    pub command_type: CommandType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub requires_ack: bool,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    HaCallService,
    HaFullResync,
    HaRefreshEntity,
    /// A command type the bridge doesn't recognize. Decodes cleanly instead
    /// of failing the whole frame, so the executor can answer with a
    /// `failed`/`UNKNOWN_COMMAND` result rather than silently dropping it.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectFrame {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Errors decoding a frame that isn't even well-formed JSON, or is missing
/// the required `type` discriminant. A recognized-but-unsupported `type`
/// is `Ok(CloudToBridge::Unknown(..))`, not an error — see module docs.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is missing the required `type` field")]
    MissingType,
}

pub fn decode_cloud_to_bridge(text: &str) -> Result<CloudToBridge, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let ty = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;

    Ok(match ty {
        "auth_result" => CloudToBridge::AuthResult(serde_json::from_value(value)?),
        "command" => CloudToBridge::Command(serde_json::from_value(value)?),
        "request_full_sync" => CloudToBridge::RequestFullSync,
        "request_heartbeat" => CloudToBridge::RequestHeartbeat,
        "disconnect" => CloudToBridge::Disconnect(serde_json::from_value(value)?),
        "request_logs" => CloudToBridge::RequestLogs,
        other => CloudToBridge::Unknown(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_frame_round_trips_its_shape() {
        let frame = BridgeToCloud::authenticate("helm-bridge-abcd1234".into(), "bc_deadbeef".into(), 1);
        let json = frame.to_json();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "authenticate");
        assert_eq!(value["bridgeId"], "helm-bridge-abcd1234");
        assert_eq!(value["bridgeCredential"], "bc_deadbeef");
        assert_eq!(value["protocolVersion"], 1);
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let decoded = decode_cloud_to_bridge(r#"{"type":"something_from_the_future","x":1}"#).unwrap();
        assert!(matches!(decoded, CloudToBridge::Unknown(t) if t == "something_from_the_future"));
    }

    #[test]
    fn missing_type_is_an_error_not_a_panic() {
        let err = decode_cloud_to_bridge(r#"{"x":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingType));
    }

    #[test]
    fn malformed_json_is_an_error_not_a_panic() {
        let err = decode_cloud_to_bridge("not json").unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn command_frame_decodes_full_service_call_payload() {
        let text = r#"{
            "type": "command",
            "cmdId": "11111111-1111-1111-1111-111111111111",
            "tenantId": "42",
            "issuedAt": "2026-07-30T00:00:00Z",
            "commandType": "ha_call_service",
            "payload": {"domain": "light", "service": "turn_on", "serviceData": {"entity_id": "light.kitchen"}},
            "requiresAck": true
        }"#;
        let decoded = decode_cloud_to_bridge(text).unwrap();
        match decoded {
            CloudToBridge::Command(cmd) => {
                assert_eq!(cmd.cmd_id, "11111111-1111-1111-1111-111111111111");
                assert_eq!(cmd.command_type, CommandType::HaCallService);
                assert!(cmd.requires_ack);
                assert_eq!(cmd.ttl_ms, None);
            }
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[test]
    fn auth_result_decodes_failure_with_error_text() {
        let text = r#"{"type":"auth_result","success":false,"error":"Credential revoked"}"#;
        let decoded = decode_cloud_to_bridge(text).unwrap();
        match decoded {
            CloudToBridge::AuthResult(r) => {
                assert!(!r.success);
                assert_eq!(r.error.as_deref(), Some("Credential revoked"));
            }
            other => panic!("expected AuthResult, got {other:?}"),
        }
    }
}
