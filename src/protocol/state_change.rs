//! `StateChangeEvent` — the opaque hub state shape carried in both the
//! hub's `event` frames and the bridge's outbound `state_batch` frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single entity state, as reported by the hub. The value and attributes
/// are opaque to the bridge — it neither interprets nor validates them,
/// it only ferries them along.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub state: String,
    #[serde(default)]
    pub attributes: Value,
    pub last_changed: chrono::DateTime<chrono::Utc>,
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

/// A hub-originated notification that one entity's state changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeEvent {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_state: Option<EntityState>,
    pub new_state: EntityState,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
