use crate::error::{AgentError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("bleemeo-agent-core/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub count: u64,
    pub next: Option<String>,
    #[allow(dead_code)]
    pub previous: Option<String>,
    pub results: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentRegistrationResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRegistrationRequest<'a> {
    pub account: &'a str,
    pub initial_password: &'a str,
    pub display_name: &'a str,
    pub fqdn: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMetric {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub item: Option<String>,
    pub threshold_low_warning: Option<f64>,
    pub threshold_low_critical: Option<f64>,
    pub threshold_high_warning: Option<f64>,
    pub threshold_high_critical: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteService {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub instance: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServicePayload {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub listen_addresses: String,
    pub exe_path: String,
    pub stack: String,
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteContainer {
    pub id: String,
    pub docker_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerPayload {
    pub host: String,
    pub name: String,
    pub command: String,
    pub docker_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_finished_at: Option<String>,
    pub docker_id: String,
    pub docker_image_id: String,
    pub docker_image_name: String,
    pub docker_inspect: Value,
    pub docker_api_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricRegistrationRequest<'a> {
    pub agent: &'a str,
    pub label: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_of: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Fact {
    pub id: String,
    pub key: String,
    pub value: String,
}

/// Thin JSON-over-HTTP client for the remote registry. Every call isolates
/// its own failure: callers decide whether a 4xx/5xx/transport error aborts
/// the reconciliation step or just that one record (§4.7, §7).
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    registration_auth: (String, String),
    agent_auth: std::sync::Arc<std::sync::RwLock<Option<(String, String)>>>,
}

impl ApiClient {
    pub fn new(base_url: String, account: String, registration_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(ApiClient {
            base_url,
            http,
            registration_auth: (account, registration_key),
            agent_auth: std::sync::Arc::new(std::sync::RwLock::new(None)),
        })
    }

    /// Switch from registration-key basic auth to `agent_uuid@domain:password`
    /// once the agent has successfully registered.
    pub fn set_agent_credentials(&self, agent_uuid: String, password: String) {
        *self.agent_auth.write().unwrap() = Some((agent_uuid, password));
    }

    fn auth(&self) -> (String, String) {
        self.agent_auth
            .read()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.registration_auth.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn request<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<R>> {
        let (user, pass) = self.auth();
        let mut req = self
            .http
            .request(method, self.url(path))
            .basic_auth(user, Some(pass))
            .header("X-Requested-With", "XMLHttpRequest");

        if let Some(body) = body {
            req = req.header("Content-Type", "application/json").json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == reqwest::StatusCode::NO_CONTENT || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp.text().await.unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|_| AgentError::Api {
                status: status.as_u16(),
                body: text,
            })
    }

    pub async fn register_agent(
        &self,
        payload: &AgentRegistrationRequest<'_>,
    ) -> Result<AgentRegistrationResponse> {
        self.request(reqwest::Method::POST, "/v1/agent/", Some(payload))
            .await?
            .ok_or_else(|| AgentError::Api {
                status: 0,
                body: "empty response registering agent".to_string(),
            })
    }

    pub async fn patch_agent_tags(&self, agent_uuid: &str, tags: &[String]) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            tags: &'a [String],
        }
        let _: Option<Value> = self
            .request(
                reqwest::Method::PATCH,
                &format!("/v1/agent/{agent_uuid}/"),
                Some(&Body { tags }),
            )
            .await?;
        Ok(())
    }

    pub async fn get_agent_tags(&self, agent_uuid: &str) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Body {
            #[serde(default)]
            tags: Vec<String>,
        }
        let body: Option<Body> = self
            .request::<(), _>(reqwest::Method::GET, &format!("/v1/agent/{agent_uuid}/"), None)
            .await?;
        Ok(body.map(|b| b.tags).unwrap_or_default())
    }

    /// Paginated GET, page size 100, following `next` until null (§6).
    async fn paginate<T: DeserializeOwned>(&self, first_path: String) -> Result<Vec<T>> {
        let mut results = Vec::new();
        let mut path = Some(first_path);

        while let Some(current) = path.take() {
            let full_path = if current.starts_with("http") {
                current.trim_start_matches(&self.base_url).to_string()
            } else {
                current
            };
            let page: Option<Page<T>> = self
                .request::<(), _>(reqwest::Method::GET, &full_path, None)
                .await?;
            if let Some(page) = page {
                results.extend(page.results);
                path = page.next;
            }
        }

        Ok(results)
    }

    pub async fn list_metrics(&self, agent_uuid: &str) -> Result<Vec<RemoteMetric>> {
        self.paginate(format!("/v1/metric/?agent={agent_uuid}&page_size=100"))
            .await
    }

    pub async fn register_metric(
        &self,
        payload: &MetricRegistrationRequest<'_>,
    ) -> Result<RemoteMetric> {
        self.request(reqwest::Method::POST, "/v1/metric/", Some(payload))
            .await?
            .ok_or_else(|| AgentError::Api {
                status: 0,
                body: "empty response registering metric".to_string(),
            })
    }

    pub async fn list_services(&self, agent_uuid: &str) -> Result<Vec<RemoteService>> {
        self.paginate(format!("/v1/service/?agent={agent_uuid}&page_size=100"))
            .await
    }

    pub async fn put_service(&self, id: &str, payload: &ServicePayload) -> Result<RemoteService> {
        self.request(reqwest::Method::PUT, &format!("/v1/service/{id}/"), Some(payload))
            .await?
            .ok_or_else(|| AgentError::Api {
                status: 0,
                body: "empty response updating service".to_string(),
            })
    }

    pub async fn post_service(&self, payload: &ServicePayload) -> Result<RemoteService> {
        self.request(reqwest::Method::POST, "/v1/service/", Some(payload))
            .await?
            .ok_or_else(|| AgentError::Api {
                status: 0,
                body: "empty response creating service".to_string(),
            })
    }

    pub async fn delete_service(&self, id: &str) -> Result<()> {
        let _: Option<Value> = self
            .request::<(), _>(reqwest::Method::DELETE, &format!("/v1/service/{id}/"), None)
            .await?;
        Ok(())
    }

    pub async fn put_container(&self, id: &str, payload: &ContainerPayload) -> Result<RemoteContainer> {
        self.request(reqwest::Method::PUT, &format!("/v1/container/{id}/"), Some(payload))
            .await?
            .ok_or_else(|| AgentError::Api {
                status: 0,
                body: "empty response updating container".to_string(),
            })
    }

    pub async fn post_container(&self, payload: &ContainerPayload) -> Result<RemoteContainer> {
        self.request(reqwest::Method::POST, "/v1/container/", Some(payload))
            .await?
            .ok_or_else(|| AgentError::Api {
                status: 0,
                body: "empty response creating container".to_string(),
            })
    }

    pub async fn delete_container(&self, id: &str) -> Result<()> {
        let _: Option<Value> = self
            .request::<(), _>(reqwest::Method::DELETE, &format!("/v1/container/{id}/"), None)
            .await?;
        Ok(())
    }

    pub async fn list_facts(&self, agent_uuid: &str) -> Result<Vec<Fact>> {
        self.paginate(format!("/v1/agentfact/?agent={agent_uuid}&page_size=100"))
            .await
    }

    pub async fn post_fact(&self, key: &str, value: &str) -> Result<Fact> {
        #[derive(Serialize)]
        struct Body<'a> {
            key: &'a str,
            value: &'a str,
        }
        self.request(reqwest::Method::POST, "/v1/agentfact/", Some(&Body { key, value }))
            .await?
            .ok_or_else(|| AgentError::Api {
                status: 0,
                body: "empty response posting fact".to_string(),
            })
    }

    pub async fn delete_fact(&self, id: &str) -> Result<()> {
        let _: Option<Value> = self
            .request::<(), _>(reqwest::Method::DELETE, &format!("/v1/agentfact/{id}/"), None)
            .await?;
        Ok(())
    }
}
