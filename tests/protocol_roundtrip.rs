//! Integration-level round-trip checks for the bridge↔cloud wire protocol.
//! Encodes every outbound variant and decodes every inbound variant,
//! confirming each one carries the shape the wire contract requires.

use helm_bridge::protocol::{
    decode_cloud_to_bridge, BridgeLogsFrame, BridgeToCloud, CloudToBridge, CommandResultError,
    CommandResultFrame, CommandStatus, CommandType, ErrorFrame, FullSyncFrame, HeartbeatFrame,
    StateBatchFrame, SyncStatusFrame,
};
use serde_json::{json, Value};

#[test]
fn every_outbound_variant_serializes_with_its_type_tag() {
    let frames = vec![
        BridgeToCloud::authenticate("helm-bridge-abcd1234".into(), "bc_deadbeef".into(), 1),
        BridgeToCloud::Heartbeat(HeartbeatFrame {
            bridge_id: "helm-bridge-abcd1234".into(),
            timestamp: chrono::Utc::now(),
            bridge_version: "0.1.0".into(),
            protocol_version: 1,
            hub_version: Some("2024.1.0".into()),
            hub_connected: true,
            cloud_connected: true,
            last_event_at: None,
            entity_count: 12,
            reconnect_count: 0,
            uptime_seconds: 42,
        }),
        BridgeToCloud::FullSync(FullSyncFrame {
            synced_at: chrono::Utc::now(),
            hub_version: Some("2024.1.0".into()),
            data: json!({"areas": [], "devices": [], "entities": [], "states": [], "services": []}),
        }),
        BridgeToCloud::StateBatch(StateBatchFrame { batch_id: "b1".into(), is_overflow: false, events: vec![] }),
        BridgeToCloud::SyncStatus(SyncStatusFrame { status: "idle".into() }),
        BridgeToCloud::command_ack("cmd-1".into(), chrono::Utc::now()),
        BridgeToCloud::CommandResult(CommandResultFrame {
            cmd_id: "cmd-1".into(),
            status: CommandStatus::Completed,
            result: Some(json!({"ok": true})),
            error: None,
        }),
        BridgeToCloud::CommandResult(CommandResultFrame {
            cmd_id: "cmd-2".into(),
            status: CommandStatus::Failed,
            result: None,
            error: Some(CommandResultError { code: "HUB_ERROR", message: "boom".into() }),
        }),
        BridgeToCloud::Error(ErrorFrame { message: "something went wrong".into() }),
        BridgeToCloud::BridgeLogs(BridgeLogsFrame { lines: vec!["line one".into()] }),
    ];

    let expected_types = [
        "authenticate", "heartbeat", "full_sync", "state_batch", "sync_status",
        "command_ack", "command_result", "command_result", "error", "bridge_logs",
    ];

    for (frame, expected_type) in frames.iter().zip(expected_types) {
        let value: Value = serde_json::from_str(&frame.to_json()).expect("valid JSON");
        assert_eq!(value["type"], expected_type);
    }
}

#[test]
fn every_inbound_variant_decodes_from_its_wire_shape() {
    let cases: Vec<(&str, fn(&CloudToBridge) -> bool)> = vec![
        (
            r#"{"type":"auth_result","success":true,"tenantId":"42"}"#,
            |f| matches!(f, CloudToBridge::AuthResult(r) if r.success && r.tenant_id.as_deref() == Some("42")),
        ),
        (
            r#"{"type":"command","cmdId":"c1","tenantId":"42","issuedAt":"2026-07-30T00:00:00Z","commandType":"ha_call_service","requiresAck":true}"#,
            |f| matches!(f, CloudToBridge::Command(c) if c.command_type == CommandType::HaCallService && c.requires_ack),
        ),
        (r#"{"type":"request_full_sync"}"#, |f| matches!(f, CloudToBridge::RequestFullSync)),
        (r#"{"type":"request_heartbeat"}"#, |f| matches!(f, CloudToBridge::RequestHeartbeat)),
        (
            r#"{"type":"disconnect","reason":"user_reset"}"#,
            |f| matches!(f, CloudToBridge::Disconnect(d) if d.reason.as_deref() == Some("user_reset")),
        ),
        (r#"{"type":"request_logs"}"#, |f| matches!(f, CloudToBridge::RequestLogs)),
        (r#"{"type":"from_the_future"}"#, |f| matches!(f, CloudToBridge::Unknown(t) if t == "from_the_future")),
    ];

    for (text, predicate) in cases {
        let decoded = decode_cloud_to_bridge(text).unwrap_or_else(|e| panic!("failed to decode {text}: {e}"));
        assert!(predicate(&decoded), "unexpected decode for {text}: {decoded:?}");
    }
}
