use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reported verdict after applying the hysteresis latch (§4.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Warning,
    Critical,
    #[default]
    Unknown,
}

impl Status {
    /// Numeric encoding used by the `_status` derived metric (§4.3).
    pub fn as_value(self) -> f64 {
        match self {
            Status::Ok => 0.0,
            Status::Warning => 1.0,
            Status::Critical => 2.0,
            Status::Unknown => 3.0,
        }
    }
}

/// A canonical metric sample, post-rename, pre- or post-threshold-evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub measurement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub time: f64,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_output: Option<String>,
}

impl MetricSample {
    pub fn new(measurement: impl Into<String>, time: f64, value: f64) -> Self {
        MetricSample {
            measurement: measurement.into(),
            item: None,
            service: None,
            container: None,
            status_of: None,
            instance: None,
            time,
            value,
            status: None,
            check_output: None,
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.item = Some(item.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Identity used by the Sample Cache (C2) and the Derivation Engine (C4).
    pub fn cache_key(&self) -> (String, Option<String>) {
        (self.measurement.clone(), self.item.clone())
    }

    /// Identity used for remote registration (C7).
    pub fn registration_key(&self) -> MetricKey {
        MetricKey {
            measurement: self.measurement.clone(),
            service: self.service.clone(),
            item: self.item.clone(),
        }
    }
}

/// `(measurement, service, item)` — unique identity for registration.
///
/// Serializes as a 3-element JSON array rather than an object so it can be
/// used as the key of a tuple-keyed persistent map (`state::TupleMap`),
/// matching the "array of `[key_tuple, value]` pairs" encoding from
/// SPEC_FULL.md §9.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricKey {
    pub measurement: String,
    pub service: Option<String>,
    pub item: Option<String>,
}

impl Serialize for MetricKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.measurement, &self.service, &self.item).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MetricKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (measurement, service, item) =
            <(String, Option<String>, Option<String>)>::deserialize(deserializer)?;
        Ok(MetricKey {
            measurement,
            service,
            item,
        })
    }
}

/// `remote_id | null | "deleted"`, as described in §3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Unregistered,
    Registered(String),
    Deleted,
}

impl RegistrationState {
    pub fn remote_id(&self) -> Option<&str> {
        match self {
            RegistrationState::Registered(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

/// Side table for registration: optional links a metric carries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// `(name, instance|null) → ...` discovered service record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub active: bool,
    #[serde(default)]
    pub exe_path: String,
    #[serde(default)]
    pub stack: String,
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub extra_ports: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<ServiceCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCredentials {
    pub user: String,
    pub password: String,
}

/// `(name, instance|null)` key for discovered/registered services.
///
/// Serializes as a 2-element JSON array for the same reason as `MetricKey`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    pub name: String,
    pub instance: Option<String>,
}

impl Serialize for ServiceKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.name, &self.instance).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ServiceKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (name, instance) = <(String, Option<String>)>::deserialize(deserializer)?;
        Ok(ServiceKey { name, instance })
    }
}

/// Local record of a service or container already registered remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredEntity {
    pub remote_id: String,
    pub last_sent_payload_hash: String,
}

/// `(measurement, item?) → bounds` — any subset may be absent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Threshold {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_critical: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_warning: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_warning: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_critical: Option<f64>,
}

impl Threshold {
    /// A threshold with all four bounds null is treated as absent (§4.3).
    pub fn is_empty(&self) -> bool {
        self.low_critical.is_none()
            && self.low_warning.is_none()
            && self.high_warning.is_none()
            && self.high_critical.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThresholdKey {
    pub measurement: String,
    pub item: Option<String>,
}

impl Serialize for ThresholdKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.measurement, &self.item).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ThresholdKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (measurement, item) = <(String, Option<String>)>::deserialize(deserializer)?;
        Ok(ThresholdKey { measurement, item })
    }
}
