use crate::model::{MetricKey, RegistrationState};
use crate::state::StateStore;
use std::collections::HashMap;

/// Idempotent, `setdefault`-style state migrations applied once on load
/// (§4.9). Never destructive; safe to run on every startup.
pub fn apply(state: &StateStore) {
    rekey_elasticsearch_search_time(state);
    default_service_fields(state);
    drop_udp6_extra_ports(state);
}

fn rekey_elasticsearch_search_time(state: &StateStore) {
    let mut registry: HashMap<MetricKey, RegistrationState> = state.get_map("metrics_registry");

    let stale: Vec<MetricKey> = registry
        .keys()
        .filter(|k| k.measurement == "elasticsearch_search_time" && k.service.is_none())
        .cloned()
        .collect();

    let mut changed = false;
    for key in stale {
        if let Some(value) = registry.remove(&key) {
            let rekeyed = MetricKey {
                measurement: key.measurement,
                service: Some("elasticsearch".to_string()),
                item: key.item,
            };
            registry.entry(rekeyed).or_insert(value);
            changed = true;
        }
    }

    if changed {
        if let Err(err) = state.set_map("metrics_registry", &registry) {
            tracing::warn!(error = %err, "failed to persist metrics_registry during migration");
        }
    }
}

fn default_service_fields(state: &StateStore) {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct RawService {
        remote_id: String,
        last_sent_payload_hash: String,
        #[serde(default)]
        active: Option<bool>,
        #[serde(default)]
        stack: Option<String>,
    }

    let Some(mut raw) = state.get("services_registry") else {
        return;
    };

    let Some(array) = raw.as_array_mut() else { return };
    let mut changed = false;

    for entry in array.iter_mut() {
        let Some(pair) = entry.as_array_mut() else { continue };
        let Some(value) = pair.get_mut(1) else { continue };
        let Some(obj) = value.as_object_mut() else { continue };

        if !obj.contains_key("active") {
            obj.insert("active".to_string(), serde_json::Value::Bool(true));
            changed = true;
        }
        if !obj.contains_key("stack") {
            obj.insert("stack".to_string(), serde_json::Value::String(String::new()));
            changed = true;
        }
    }

    if changed {
        if let Err(err) = state.set("services_registry", &raw) {
            tracing::warn!(error = %err, "failed to persist services_registry during migration");
        }
    }
}

fn drop_udp6_extra_ports(state: &StateStore) {
    let Some(mut raw) = state.get("discovered_services") else {
        return;
    };
    let Some(array) = raw.as_array_mut() else { return };
    let mut changed = false;

    for entry in array.iter_mut() {
        let Some(pair) = entry.as_array_mut() else { continue };
        let Some(value) = pair.get_mut(1) else { continue };
        let Some(obj) = value.as_object_mut() else { continue };
        let Some(ports) = obj.get_mut("extra_ports").and_then(|p| p.as_object_mut()) else {
            continue;
        };

        let udp6_keys: Vec<String> = ports
            .keys()
            .filter(|k| k.ends_with("/udp6"))
            .cloned()
            .collect();
        for key in udp6_keys {
            ports.remove(&key);
            changed = true;
        }
    }

    if changed {
        if let Err(err) = state.set("discovered_services", &raw) {
            tracing::warn!(error = %err, "failed to persist discovered_services during migration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rekeys_elasticsearch_search_time_without_service() {
        let dir = std::env::temp_dir().join(format!("bleemeo-migrations-test-{}", std::process::id()));
        let state = StateStore::load(&dir).unwrap();

        let mut registry: HashMap<MetricKey, RegistrationState> = HashMap::new();
        registry.insert(
            MetricKey {
                measurement: "elasticsearch_search_time".to_string(),
                service: None,
                item: None,
            },
            RegistrationState::Registered("abc".to_string()),
        );
        state.set_map("metrics_registry", &registry).unwrap();

        apply(&state);

        let migrated: HashMap<MetricKey, RegistrationState> = state.get_map("metrics_registry");
        assert!(migrated.contains_key(&MetricKey {
            measurement: "elasticsearch_search_time".to_string(),
            service: Some("elasticsearch".to_string()),
            item: None,
        }));
        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn is_idempotent_on_already_migrated_state() {
        let dir = std::env::temp_dir().join(format!("bleemeo-migrations-test2-{}", std::process::id()));
        let state = StateStore::load(&dir).unwrap();
        apply(&state);
        apply(&state);
        let _ = std::fs::remove_file(&dir);
    }
}
