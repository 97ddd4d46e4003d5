use crate::error::{AgentError, Result};
use rand::Rng;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

/// File-sourced settings, merged with CLI flags and `BLEEMEO_AGENT_*`
/// environment overrides by [`AgentConfig::load`] (§6, §10.1).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub account: Option<String>,
    pub registration_key: Option<String>,
    pub api_base: Option<String>,
    pub mqtt_host: Option<String>,
    pub mqtt_port: Option<u16>,
    pub mqtt_ssl: Option<bool>,
    pub display_name: Option<String>,
    pub tags: Vec<String>,
    pub logging_level: Option<String>,
    pub logging_output: Option<String>,
    pub thresholds: std::collections::HashMap<String, ThresholdFileEntry>,
    /// Disk path prefixes never forwarded to the rename table (§4.4).
    pub df_path_ignore: Vec<String>,
    /// When set, only paths under this prefix are kept, with the prefix
    /// itself stripped (container-view filtering, §4.4).
    pub df_host_mount_point: Option<String>,
    /// Device name allow-list (regexes); empty means "monitor everything".
    pub disk_monitor: Vec<String>,
    /// Network interface names never forwarded to the rename table.
    pub network_interface_blacklist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdFileEntry {
    pub low_critical: Option<f64>,
    pub low_warning: Option<f64>,
    pub high_warning: Option<f64>,
    pub high_critical: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub account: String,
    pub registration_key: String,
    pub api_base: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_ssl: bool,
    pub display_name: String,
    pub tags: Vec<String>,

    pub collector_listen_addr: std::net::SocketAddr,
    pub state_file: PathBuf,
    pub reconcile_interval: Duration,
    pub health_check_interval: Duration,
    pub top_info_interval: Duration,
    pub cache_purge_interval: Duration,
    pub shutdown_timeout: Duration,

    pub once: bool,
    pub dry_run: bool,

    pub thresholds: std::collections::HashMap<crate::model::ThresholdKey, crate::model::Threshold>,

    pub df_path_ignore: Vec<String>,
    pub df_host_mount_point: Option<String>,
    pub disk_monitor: Vec<String>,
    pub network_interface_blacklist: Vec<String>,
}

impl AgentConfig {
    /// Merge CLI flags, an optional TOML config file, and `BLEEMEO_AGENT_*`
    /// environment overrides. Environment values win over the file; CLI
    /// flags win over both (§6, §10.1).
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        config_path: Option<&std::path::Path>,
        cli_account: Option<String>,
        cli_registration_key: Option<String>,
        cli_api_base: Option<String>,
        cli_mqtt_host: Option<String>,
        cli_mqtt_port: Option<u16>,
        cli_mqtt_ssl: Option<bool>,
        cli_display_name: Option<String>,
        collector_listen_addr: std::net::SocketAddr,
        state_file: PathBuf,
        reconcile_seconds: u64,
        once: bool,
        dry_run: bool,
    ) -> Result<Self> {
        let file: ConfigFile = match config_path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|source| AgentError::StateRead {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|err| AgentError::Config(err.to_string()))?
            }
            _ => ConfigFile::default(),
        };

        let env = |name: &str| std::env::var(format!("BLEEMEO_AGENT_{name}")).ok();

        let account = cli_account
            .or_else(|| env("ACCOUNT"))
            .or(file.account)
            .ok_or_else(|| AgentError::Config("missing account id".to_string()))?;
        let registration_key = cli_registration_key
            .or_else(|| env("REGISTRATION_KEY"))
            .or(file.registration_key)
            .ok_or_else(|| AgentError::Config("missing registration key".to_string()))?;
        let api_base = cli_api_base
            .or_else(|| env("API_BASE"))
            .or(file.api_base)
            .unwrap_or_else(|| "https://api.bleemeo.com".to_string());
        let mqtt_host = cli_mqtt_host
            .or_else(|| env("MQTT_HOST"))
            .or(file.mqtt_host)
            .unwrap_or_else(|| "mqtt.bleemeo.com".to_string());
        let mqtt_port = cli_mqtt_port
            .or_else(|| env("MQTT_PORT").and_then(|v| v.parse().ok()))
            .or(file.mqtt_port)
            .unwrap_or(8883);
        let mqtt_ssl = cli_mqtt_ssl
            .or_else(|| env("MQTT_SSL").and_then(|v| v.parse().ok()))
            .or(file.mqtt_ssl)
            .unwrap_or(true);
        let display_name = cli_display_name
            .or(file.display_name)
            .unwrap_or_else(|| hostname());

        if !api_base.starts_with("https://") {
            tracing::warn!(api_base = %api_base, "api_base is not https:// — traffic will not be encrypted");
        }

        let mut thresholds = std::collections::HashMap::new();
        for (measurement, entry) in file.thresholds {
            thresholds.insert(
                crate::model::ThresholdKey {
                    measurement,
                    item: None,
                },
                crate::model::Threshold {
                    low_critical: entry.low_critical,
                    low_warning: entry.low_warning,
                    high_warning: entry.high_warning,
                    high_critical: entry.high_critical,
                },
            );
        }

        let reconcile_interval = Duration::from_secs(reconcile_seconds.max(5));
        if reconcile_seconds < 5 {
            tracing::warn!(
                requested = reconcile_seconds,
                "reconcile interval below 5s is unreasonably aggressive; clamped to 5s"
            );
        }

        Ok(AgentConfig {
            account,
            registration_key,
            api_base,
            mqtt_host,
            mqtt_port,
            mqtt_ssl,
            display_name,
            tags: file.tags,
            collector_listen_addr,
            state_file,
            reconcile_interval,
            health_check_interval: Duration::from_secs(60),
            top_info_interval: Duration::from_secs(10),
            cache_purge_interval: Duration::from_secs(5 * 60),
            shutdown_timeout: Duration::from_secs(6),
            once,
            dry_run,
            thresholds,
            df_path_ignore: file.df_path_ignore,
            df_host_mount_point: file.df_host_mount_point,
            disk_monitor: file.disk_monitor,
            network_interface_blacklist: file.network_interface_blacklist,
        })
    }
}

fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string())
}

/// Generated once per agent lifetime and persisted; never re-derived
/// (§4.7 step 1).
pub fn generate_password() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..32).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_password_produces_32_chars() {
        let p = generate_password();
        assert_eq!(p.len(), 32);
    }

    #[test]
    fn reconcile_interval_is_clamped_to_minimum() {
        let config = AgentConfig::load(
            None,
            Some("acc".to_string()),
            Some("key".to_string()),
            None,
            None,
            None,
            None,
            None,
            "127.0.0.1:2003".parse().unwrap(),
            PathBuf::from("/tmp/does-not-exist-state.json"),
            1,
            false,
            false,
        )
        .unwrap();
        assert_eq!(config.reconcile_interval, Duration::from_secs(5));
    }
}
