use crate::api::{
    AgentRegistrationRequest, ApiClient, ContainerPayload, MetricRegistrationRequest, ServicePayload,
};
use crate::cache::{now_secs, SampleCache};
use crate::model::{
    DiscoveredService, MetricInfo, MetricKey, RegisteredEntity, RegistrationState, ServiceKey,
    Threshold, ThresholdKey,
};
use crate::state::StateStore;
use crate::threshold::ThresholdEngine;
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;

const METRIC_FAILURE_BUDGET: usize = 3;
const NULL_DOCKER_TIME: &str = "0001-01-01T00:00:00Z";

/// A container observed by the (out-of-scope) discovery subsystem; the
/// Reconciler only needs its registration-relevant fields (§4.7 step 5).
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoveredContainer {
    pub docker_id: String,
    pub name: String,
    pub command: String,
    pub docker_status: String,
    pub created_at: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub image_id: String,
    pub image_name: String,
    pub inspect: serde_json::Value,
    pub api_version: String,
}

fn sentinel_to_null(value: &Option<String>) -> Option<String> {
    match value {
        Some(v) if v == NULL_DOCKER_TIME => None,
        other => other.clone(),
    }
}

fn container_payload_hash(container: &DiscoveredContainer) -> String {
    let canonical = serde_json::to_string(container).unwrap_or_default();
    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn service_payload(key: &ServiceKey, discovered: &DiscoveredService) -> ServicePayload {
    let listen_addresses = if discovered.extra_ports.is_empty() {
        format!(
            "{}:{}/{}",
            discovered.address,
            discovered.port,
            format!("{:?}", discovered.protocol).to_lowercase()
        )
    } else {
        discovered
            .extra_ports
            .iter()
            .map(|(port_proto, addr)| format!("{addr}:{port_proto}"))
            .collect::<Vec<_>>()
            .join(",")
    };

    ServicePayload {
        label: key.name.clone(),
        instance: key.instance.clone(),
        listen_addresses,
        exe_path: discovered.exe_path.clone(),
        stack: discovered.stack.clone(),
        active: discovered.active,
    }
}

/// Periodic synchronization of local state with the remote registry (C7).
/// Each of the 8 steps is isolated: an error in one does not prevent the
/// next from running (§4.7, §7).
pub struct Reconciler {
    api: ApiClient,
    state: Arc<StateStore>,
    threshold: Arc<ThresholdEngine>,
    cache: Arc<SampleCache>,
    account: String,
    display_name: String,
    tags: Vec<String>,
}

impl Reconciler {
    pub fn new(
        api: ApiClient,
        state: Arc<StateStore>,
        threshold: Arc<ThresholdEngine>,
        cache: Arc<SampleCache>,
        account: String,
        display_name: String,
        tags: Vec<String>,
    ) -> Self {
        Reconciler {
            api,
            state,
            threshold,
            cache,
            account,
            display_name,
            tags,
        }
    }

    fn agent_uuid(&self) -> Option<String> {
        self.state.get_typed::<String>("agent_uuid")
    }

    /// Runs the full 8-step pass. `fqdn` is `None` until a fact snapshot
    /// carrying it is available, which also gates step 1 (§4.7 step 1).
    pub async fn run_pass(
        &self,
        fqdn: Option<&str>,
        discovered_services: &[(ServiceKey, DiscoveredService)],
        discovered_containers: &[DiscoveredContainer],
        facts: &[(String, String)],
    ) {
        self.step1_register_agent(fqdn).await;

        let Some(agent_uuid) = self.agent_uuid() else {
            tracing::debug!("reconcile pass skipped: agent not yet registered");
            return;
        };

        self.step2_purge_deleted_services(&agent_uuid, discovered_services)
            .await;
        self.step3_fetch_thresholds(&agent_uuid).await;
        self.step4_update_tags(&agent_uuid).await;
        self.step5_register_containers(discovered_containers).await;
        self.step6_register_services(discovered_services).await;
        self.step7_register_metrics(&agent_uuid).await;
        self.step8_send_facts(&agent_uuid, facts).await;
    }

    async fn step1_register_agent(&self, fqdn: Option<&str>) {
        if self.agent_uuid().is_some() {
            return;
        }
        let Some(fqdn) = fqdn else {
            tracing::debug!("agent registration deferred: no fqdn fact yet");
            return;
        };

        let password = match self.state.get_typed::<String>("password") {
            Some(p) => p,
            None => {
                let generated = crate::config::generate_password();
                if let Err(err) = self.state.set("password", &generated) {
                    tracing::warn!(error = %err, "failed to persist generated password");
                    return;
                }
                generated
            }
        };

        let payload = AgentRegistrationRequest {
            account: &self.account,
            initial_password: &password,
            display_name: &self.display_name,
            fqdn,
        };

        match self.api.register_agent(&payload).await {
            Ok(resp) => {
                if let Err(err) = self.state.set("agent_uuid", &resp.id) {
                    tracing::warn!(error = %err, "failed to persist agent_uuid");
                    return;
                }
                self.api.set_agent_credentials(resp.id.clone(), password);
                tracing::info!(agent_uuid = %resp.id, "agent registered");
            }
            Err(err) => tracing::warn!(error = %err, "agent registration failed"),
        }
    }

    async fn step2_purge_deleted_services(
        &self,
        agent_uuid: &str,
        discovered_services: &[(ServiceKey, DiscoveredService)],
    ) {
        let mut registry: HashMap<ServiceKey, RegisteredEntity> =
            self.state.get_map("services_registry");

        let local_keys: std::collections::HashSet<&ServiceKey> =
            discovered_services.iter().map(|(k, _)| k).collect();

        let locally_stale: Vec<ServiceKey> = registry
            .keys()
            .filter(|k| !local_keys.contains(k))
            .cloned()
            .collect();

        for key in locally_stale {
            if let Some(entry) = registry.get(&key) {
                match self.api.delete_service(&entry.remote_id).await {
                    Ok(()) => {
                        registry.remove(&key);
                    }
                    Err(err) => tracing::debug!(error = %err, label = %key.name, "service delete failed"),
                }
            }
        }

        match self.api.list_services(agent_uuid).await {
            Ok(remote) => {
                let remote_ids: std::collections::HashSet<&str> =
                    remote.iter().map(|s| s.id.as_str()).collect();
                registry.retain(|_, entry| remote_ids.contains(entry.remote_id.as_str()));
            }
            Err(err) => {
                tracing::debug!(error = %err, "listing remote services failed; skipping remote-side purge")
            }
        }

        if let Err(err) = self.state.set_map("services_registry", &registry) {
            tracing::warn!(error = %err, "failed to persist services_registry");
        }
    }

    async fn step3_fetch_thresholds(&self, agent_uuid: &str) {
        let remote_metrics = match self.api.list_metrics(agent_uuid).await {
            Ok(m) => m,
            Err(err) => {
                tracing::debug!(error = %err, "fetching thresholds failed");
                return;
            }
        };

        let mut thresholds = HashMap::new();
        let mut remote_labels_by_id: HashMap<String, ThresholdKey> = HashMap::new();

        for metric in &remote_metrics {
            let key = ThresholdKey {
                measurement: metric.label.clone(),
                item: metric.item.clone().filter(|s| !s.is_empty()),
            };
            thresholds.insert(
                key.clone(),
                Threshold {
                    low_critical: metric.threshold_low_critical,
                    low_warning: metric.threshold_low_warning,
                    high_warning: metric.threshold_high_warning,
                    high_critical: metric.threshold_high_critical,
                },
            );
            remote_labels_by_id.insert(metric.id.clone(), key);
        }

        self.threshold.update_thresholds(thresholds);

        let mut registry: HashMap<MetricKey, RegistrationState> = self.state.get_map("metrics_registry");
        let mut purged = Vec::new();
        registry.retain(|key, state| match state.remote_id() {
            Some(id) if !remote_labels_by_id.contains_key(id) => {
                purged.push((key.measurement.clone(), key.item.clone()));
                false
            }
            _ => true,
        });
        if let Err(err) = self.state.set_map("metrics_registry", &registry) {
            tracing::warn!(error = %err, "failed to persist metrics_registry");
        }
        if !purged.is_empty() {
            self.cache.purge(now_secs(), &purged);
        }
    }

    async fn step4_update_tags(&self, agent_uuid: &str) {
        let previously_applied: Vec<String> = self
            .state
            .get_typed("applied_tags")
            .unwrap_or_default();
        if previously_applied == self.tags {
            return;
        }

        let current_remote = match self.api.get_agent_tags(agent_uuid).await {
            Ok(t) => t,
            Err(err) => {
                tracing::debug!(error = %err, "fetching current tags failed");
                return;
            }
        };

        let removed: std::collections::HashSet<&String> = previously_applied
            .iter()
            .filter(|t| !self.tags.contains(t))
            .collect();
        let mut next: Vec<String> = current_remote
            .into_iter()
            .filter(|t| !removed.contains(t))
            .collect();
        for tag in &self.tags {
            if !next.contains(tag) {
                next.push(tag.clone());
            }
        }

        match self.api.patch_agent_tags(agent_uuid, &next).await {
            Ok(()) => {
                let _ = self.state.set("applied_tags", &self.tags);
            }
            Err(err) => tracing::debug!(error = %err, "updating tags failed"),
        }
    }

    async fn step5_register_containers(&self, discovered: &[DiscoveredContainer]) {
        let mut registry: HashMap<String, RegisteredEntity> = self
            .state
            .get_typed("containers_registry")
            .unwrap_or_default();

        let seen: std::collections::HashSet<&str> =
            discovered.iter().map(|c| c.docker_id.as_str()).collect();
        let gone: Vec<String> = registry
            .keys()
            .filter(|id| !seen.contains(id.as_str()))
            .cloned()
            .collect();
        for docker_id in gone {
            if let Some(entry) = registry.get(&docker_id) {
                if self.api.delete_container(&entry.remote_id).await.is_ok() {
                    registry.remove(&docker_id);
                }
            }
        }

        for container in discovered {
            let hash = container_payload_hash(container);
            let unchanged = registry
                .get(&container.docker_id)
                .map(|e| e.last_sent_payload_hash == hash)
                .unwrap_or(false);
            if unchanged {
                continue;
            }

            let payload = ContainerPayload {
                host: String::new(),
                name: container.name.clone(),
                command: container.command.clone(),
                docker_status: container.docker_status.clone(),
                docker_created_at: sentinel_to_null(&container.created_at),
                docker_started_at: sentinel_to_null(&container.started_at),
                docker_finished_at: sentinel_to_null(&container.finished_at),
                docker_id: container.docker_id.clone(),
                docker_image_id: container.image_id.clone(),
                docker_image_name: container.image_name.clone(),
                docker_inspect: container.inspect.clone(),
                docker_api_version: container.api_version.clone(),
            };

            let result = match registry.get(&container.docker_id) {
                Some(entry) => self.api.put_container(&entry.remote_id, &payload).await,
                None => self.api.post_container(&payload).await,
            };

            match result {
                Ok(remote) => {
                    registry.insert(
                        container.docker_id.clone(),
                        RegisteredEntity {
                            remote_id: remote.id,
                            last_sent_payload_hash: hash,
                        },
                    );
                }
                Err(err) => tracing::debug!(error = %err, docker_id = %container.docker_id, "container registration failed"),
            }
        }

        if let Err(err) = self.state.set("containers_registry", &registry) {
            tracing::warn!(error = %err, "failed to persist containers_registry");
        }
    }

    async fn step6_register_services(&self, discovered: &[(ServiceKey, DiscoveredService)]) {
        let mut registry: HashMap<ServiceKey, RegisteredEntity> =
            self.state.get_map("services_registry");

        for (key, service) in discovered {
            let payload = service_payload(key, service);
            let hash = {
                let canonical = serde_json::to_string(&payload).unwrap_or_default();
                let mut hasher = Sha1::new();
                hasher.update(canonical.as_bytes());
                format!("{:x}", hasher.finalize())
            };

            let unchanged = registry
                .get(key)
                .map(|e| e.last_sent_payload_hash == hash)
                .unwrap_or(false);
            if unchanged {
                continue;
            }

            let result = match registry.get(key) {
                Some(entry) => self.api.put_service(&entry.remote_id, &payload).await,
                None => self.api.post_service(&payload).await,
            };

            match result {
                Ok(remote) => {
                    registry.insert(
                        key.clone(),
                        RegisteredEntity {
                            remote_id: remote.id,
                            last_sent_payload_hash: hash,
                        },
                    );
                }
                Err(err) => tracing::debug!(error = %err, label = %key.name, "service registration failed"),
            }
        }

        if let Err(err) = self.state.set_map("services_registry", &registry) {
            tracing::warn!(error = %err, "failed to persist services_registry");
        }
    }

    async fn step7_register_metrics(&self, agent_uuid: &str) {
        let mut registry: HashMap<MetricKey, RegistrationState> = self.state.get_map("metrics_registry");
        let metric_info: HashMap<MetricKey, MetricInfo> = self.state.get_map("metric_info");
        let services_registry: HashMap<ServiceKey, RegisteredEntity> =
            self.state.get_map("services_registry");
        let containers_registry: HashMap<String, RegisteredEntity> = self
            .state
            .get_typed("containers_registry")
            .unwrap_or_default();

        let mut unregistered: Vec<MetricKey> = registry
            .iter()
            .filter(|(_, state)| matches!(state, RegistrationState::Unregistered))
            .map(|(k, _)| k.clone())
            .collect();
        unregistered.shuffle(&mut rand::thread_rng());

        let mut failures = 0usize;
        let mut purge_set = Vec::new();

        for key in unregistered {
            if failures >= METRIC_FAILURE_BUDGET {
                break;
            }

            let Some(info) = metric_info.get(&key) else {
                registry.remove(&key);
                purge_set.push((key.measurement.clone(), key.item.clone()));
                continue;
            };

            let status_of_id = if let Some(parent_name) = &info.status_of {
                let parent_key = MetricKey {
                    measurement: parent_name.clone(),
                    service: key.service.clone(),
                    item: key.item.clone(),
                };
                match registry.get(&parent_key).and_then(|s| s.remote_id()) {
                    Some(id) => Some(id.to_string()),
                    None => continue,
                }
            } else {
                None
            };

            let container_id = if let Some(container_name) = &info.container_name {
                match containers_registry.get(container_name) {
                    Some(entry) => Some(entry.remote_id.clone()),
                    None => continue,
                }
            } else {
                None
            };

            let service_id = if let Some(service_name) = &key.service {
                let service_key = ServiceKey {
                    name: service_name.clone(),
                    instance: info.instance.clone(),
                };
                match services_registry.get(&service_key) {
                    Some(entry) => Some(entry.remote_id.clone()),
                    None => {
                        registry.remove(&key);
                        purge_set.push((key.measurement.clone(), key.item.clone()));
                        continue;
                    }
                }
            } else {
                None
            };

            let payload = MetricRegistrationRequest {
                agent: agent_uuid,
                label: &key.measurement,
                status_of: status_of_id.as_deref(),
                container: container_id.as_deref(),
                service: service_id.as_deref(),
                item: key.item.as_deref(),
            };

            match self.api.register_metric(&payload).await {
                Ok(remote) => {
                    registry.insert(key.clone(), RegistrationState::Registered(remote.id));
                }
                Err(crate::error::AgentError::Api { status, .. }) if (400..500).contains(&status) => {
                    failures += 1;
                }
                Err(err) => {
                    tracing::debug!(error = %err, label = %key.measurement, "metric registration pass aborted");
                    break;
                }
            }
        }

        if let Err(err) = self.state.set_map("metrics_registry", &registry) {
            tracing::warn!(error = %err, "failed to persist metrics_registry");
        }
        if !purge_set.is_empty() {
            self.cache.purge(now_secs(), &purge_set);
        }
    }

    async fn step8_send_facts(&self, agent_uuid: &str, facts: &[(String, String)]) {
        let _ = agent_uuid;
        let remote_facts = match self.api.list_facts(agent_uuid).await {
            Ok(f) => f,
            Err(err) => {
                tracing::debug!(error = %err, "listing remote facts failed");
                return;
            }
        };

        let mut all_succeeded = true;
        for (key, value) in facts {
            if let Err(err) = self.api.post_fact(key, value).await {
                tracing::debug!(error = %err, key = %key, "posting fact failed");
                all_succeeded = false;
                break;
            }
        }

        if all_succeeded {
            for fact in remote_facts {
                let _ = self.api.delete_fact(&fact.id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;
    use std::collections::BTreeMap;

    #[test]
    fn container_hash_is_stable_for_same_payload() {
        let container = DiscoveredContainer {
            docker_id: "abc".to_string(),
            name: "web".to_string(),
            command: "nginx".to_string(),
            docker_status: "running".to_string(),
            created_at: None,
            started_at: None,
            finished_at: None,
            image_id: "img1".to_string(),
            image_name: "nginx:latest".to_string(),
            inspect: serde_json::json!({"a": 1}),
            api_version: "1.41".to_string(),
        };

        let h1 = container_payload_hash(&container);
        let h2 = container_payload_hash(&container);
        assert_eq!(h1, h2);

        let mut changed = container.clone();
        changed.docker_status = "stopped".to_string();
        assert_ne!(h1, container_payload_hash(&changed));
    }

    #[test]
    fn sentinel_docker_time_becomes_null() {
        assert_eq!(sentinel_to_null(&Some(NULL_DOCKER_TIME.to_string())), None);
        assert_eq!(
            sentinel_to_null(&Some("2024-01-01T00:00:00Z".to_string())),
            Some("2024-01-01T00:00:00Z".to_string())
        );
    }

    #[test]
    fn service_payload_prefers_extra_ports_listen_addresses() {
        let key = ServiceKey {
            name: "nginx".to_string(),
            instance: None,
        };
        let mut extra_ports = BTreeMap::new();
        extra_ports.insert("80/tcp".to_string(), "10.0.0.5".to_string());
        let discovered = DiscoveredService {
            active: true,
            exe_path: "/usr/sbin/nginx".to_string(),
            stack: "".to_string(),
            address: "127.0.0.1".to_string(),
            port: 80,
            protocol: Protocol::Tcp,
            extra_ports,
            container_id: None,
            credentials: None,
        };

        let payload = service_payload(&key, &discovered);
        assert_eq!(payload.listen_addresses, "10.0.0.5:80/tcp");
    }
}
