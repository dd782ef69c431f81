//! Full-sync collector — assembles one snapshot of the hub's areas,
//! devices, entities, states, and services, tolerating individual RPC
//! failures rather than failing the whole sync. Issues the calls
//! concurrently through `tokio::join!` since the set is fixed and known
//! at compile time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::HubRpcError;
use crate::hub::HubSession;
use crate::protocol::{BridgeToCloud, FullSyncFrame};

#[derive(Clone)]
pub struct FullSyncCollector {
    hub: Arc<HubSession>,
}

/// One assembled snapshot, still split out so the orchestrator can read
/// `hub_version` for heartbeats without re-parsing the sync payload.
pub struct FullSyncSnapshot {
    pub hub_version: Option<String>,
    pub data: Value,
}

impl FullSyncCollector {
    pub fn new(hub: Arc<HubSession>) -> Self {
        Self { hub }
    }

    /// Issues the five hub RPCs concurrently. A failed RPC is logged and
    /// substituted with an empty array/object rather than aborting the
    /// whole sync.
    pub async fn collect(&self) -> FullSyncSnapshot {
        let (config, areas, devices, entities, states, services) = tokio::join!(
            self.hub.get_config(),
            self.hub.get_areas(),
            self.hub.get_devices(),
            self.hub.get_entities(),
            self.hub.get_states(),
            self.hub.get_services(),
        );

        let hub_version = config
            .ok()
            .and_then(|c| c.get("version").and_then(Value::as_str).map(str::to_string));

        let areas = substitute(areas, "areas", Value::Array(Vec::new()));
        let devices = substitute(devices, "devices", Value::Array(Vec::new()));
        let entities = substitute(entities, "entities", Value::Array(Vec::new()));
        let states = substitute(states, "states", Value::Array(Vec::new()));
        let services = substitute(services, "services", Value::Object(serde_json::Map::new()));

        let index = build_entity_index(&entities);
        let states = enrich_states_with_registry(states, &index);
        let services = services_map_to_array(services);

        FullSyncSnapshot {
            hub_version,
            data: json!({
                "areas": areas,
                "devices": devices,
                "entities": entities,
                "states": states,
                "services": services,
            }),
        }
    }

    pub async fn collect_frame(&self) -> BridgeToCloud {
        let snapshot = self.collect().await;
        BridgeToCloud::FullSync(FullSyncFrame {
            synced_at: Utc::now(),
            hub_version: snapshot.hub_version,
            data: snapshot.data,
        })
    }
}

fn substitute(result: Result<Value, HubRpcError>, label: &str, fallback: Value) -> Value {
    match result {
        Ok(v) => v,
        Err(e) => {
            warn!(component = label, error = %e, "full sync: substituting empty result after RPC failure");
            fallback
        }
    }
}

/// `entity_id -> (device_id, area_id)`, built from the entity registry
/// listing so per-state device/area ids can be attached without a second
/// round trip per entity.
fn build_entity_index(entities: &Value) -> HashMap<String, (Option<String>, Option<String>)> {
    let mut index = HashMap::new();
    if let Value::Array(list) = entities {
        for entry in list {
            if let Some(entity_id) = entry.get("entity_id").and_then(Value::as_str) {
                let device_id = entry.get("device_id").and_then(Value::as_str).map(str::to_string);
                let area_id = entry.get("area_id").and_then(Value::as_str).map(str::to_string);
                index.insert(entity_id.to_string(), (device_id, area_id));
            }
        }
    }
    index
}

fn enrich_states_with_registry(
    states: Value,
    index: &HashMap<String, (Option<String>, Option<String>)>,
) -> Value {
    let Value::Array(list) = states else {
        return states;
    };
    let enriched = list
        .into_iter()
        .map(|mut state| {
            let entity_id = state.get("entity_id").and_then(Value::as_str).map(str::to_string);
            if let (Some(entity_id), Value::Object(map)) = (entity_id, &mut state) {
                if let Some((device_id, area_id)) = index.get(&entity_id) {
                    map.insert("deviceId".into(), device_id.clone().map(Value::String).unwrap_or(Value::Null));
                    map.insert("areaId".into(), area_id.clone().map(Value::String).unwrap_or(Value::Null));
                }
            }
            state
        })
        .collect();
    Value::Array(enriched)
}

/// The hub reports services as `{domain: {service_name: {...}}}`; the cloud
/// wire format wants `[{domain, services: [service_name, ...]}]`.
fn services_map_to_array(services: Value) -> Value {
    let Value::Object(domains) = services else {
        return Value::Array(Vec::new());
    };
    let array = domains
        .into_iter()
        .map(|(domain, service_map)| {
            let names: Vec<Value> = match service_map {
                Value::Object(m) => m.into_keys().map(Value::String).collect(),
                _ => Vec::new(),
            };
            json!({"domain": domain, "services": names})
        })
        .collect();
    Value::Array(array)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_index_maps_entity_id_to_device_and_area() {
        let entities = json!([
            {"entity_id": "light.kitchen", "device_id": "dev1", "area_id": "area1"},
            {"entity_id": "sensor.no_links"},
        ]);
        let index = build_entity_index(&entities);
        assert_eq!(
            index.get("light.kitchen"),
            Some(&(Some("dev1".to_string()), Some("area1".to_string())))
        );
        assert_eq!(index.get("sensor.no_links"), Some(&(None, None)));
    }

    #[test]
    fn states_get_device_and_area_ids_attached() {
        let states = json!([{"entity_id": "light.kitchen", "state": "on"}]);
        let mut index = HashMap::new();
        index.insert("light.kitchen".to_string(), (Some("dev1".to_string()), Some("area1".to_string())));
        let enriched = enrich_states_with_registry(states, &index);
        assert_eq!(enriched[0]["deviceId"], "dev1");
        assert_eq!(enriched[0]["areaId"], "area1");
    }

    #[test]
    fn services_map_becomes_domain_array() {
        let services = json!({"light": {"turn_on": {}, "turn_off": {}}});
        let array = services_map_to_array(services);
        assert_eq!(array[0]["domain"], "light");
        let names = array[0]["services"].as_array().unwrap();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn non_array_services_payload_falls_back_to_empty_array() {
        assert_eq!(services_map_to_array(Value::Null), json!([]));
    }
}
