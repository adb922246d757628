//! # Core Data Types
//!
//! Value types shared by every part of the service cache:
//! - `ServiceRecord` / `PolicyRecord`: a published endpoint and the policy it owns
//! - `RequestAttributes`: the resolution-relevant view of an already-parsed request
//! - `ServiceStatistics`: per-service usage counters kept next to the cache
//!
//! Records are plain data. They are cloned into and out of the cache so that a
//! caller never holds a reference into the locked map.

use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque, immutable identifier of a published service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a policy; each policy is owned by exactly one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(pub u64);

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The policy document attached to a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: PolicyId,
    /// Incremented by the store on every policy save
    pub version: u64,
    /// Policy source handed to the policy runtime for compilation
    pub xml: String,
}

impl PolicyRecord {
    pub fn new(id: PolicyId, version: u64, xml: impl Into<String>) -> Self {
        Self {
            id,
            version,
            xml: xml.into(),
        }
    }
}

/// A published service as stored in the durable store and mirrored in the cache
///
/// `policy` is optional here because the store can hand back a record whose
/// policy could not be loaded. Such a record is rejected by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: ServiceId,
    pub name: String,
    pub enabled: bool,
    /// Internal services are published by the gateway itself rather than an administrator
    #[serde(default)]
    pub internal: bool,
    /// Path this service is published under; `None` for services resolved by SOAP content only
    pub routing_uri: Option<String>,
    /// Accepted HTTP methods; empty means every method is accepted
    #[serde(with = "methods_serde", default)]
    pub http_methods: Vec<Method>,
    #[serde(default)]
    pub soap: bool,
    #[serde(default)]
    pub soap_actions: Vec<String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// When false, a SOAP service only resolves for SOAP requests
    #[serde(default)]
    pub lax_resolution: bool,
    pub version: u64,
    pub policy: Option<PolicyRecord>,
}

impl ServiceRecord {
    /// Create an enabled, non-SOAP service accepting every HTTP method
    pub fn new(id: ServiceId, name: impl Into<String>, routing_uri: Option<&str>) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            internal: false,
            routing_uri: routing_uri.map(str::to_string),
            http_methods: Vec::new(),
            soap: false,
            soap_actions: Vec::new(),
            namespaces: Vec::new(),
            lax_resolution: false,
            version: 1,
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: PolicyRecord) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.http_methods = methods;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Turn this record into a SOAP service with the given operations and namespaces
    pub fn with_soap(mut self, soap_actions: Vec<String>, namespaces: Vec<String>) -> Self {
        self.soap = true;
        self.soap_actions = soap_actions;
        self.namespaces = namespaces;
        self
    }

    pub fn with_lax_resolution(mut self, lax: bool) -> Self {
        self.lax_resolution = lax;
        self
    }

    pub fn policy_id(&self) -> Option<PolicyId> {
        self.policy.as_ref().map(|p| p.id)
    }

    /// Human-readable identity used in audits and conflict reports
    pub fn display_name(&self) -> String {
        format!("{} [#{}]", self.name, self.id)
    }

    pub fn accepts_method(&self, method: &Method) -> bool {
        self.http_methods.is_empty() || self.http_methods.contains(method)
    }
}

/// Resolution-relevant attributes of an inbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAttributes {
    pub path: String,
    #[serde(with = "method_serde", default = "default_method")]
    pub method: Method,
    #[serde(default)]
    pub soap: bool,
    #[serde(default)]
    pub soap_action: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Service id carried in the request URL (`/service/{id}`), if any
    #[serde(default)]
    pub service_id_hint: Option<ServiceId>,
}

fn default_method() -> Method {
    Method::GET
}

impl RequestAttributes {
    /// Plain HTTP request; a `/service/{id}` path also sets the service id hint
    pub fn http(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let service_id_hint = parse_service_id_hint(&path);
        Self {
            path,
            method,
            soap: false,
            soap_action: None,
            namespace: None,
            service_id_hint,
        }
    }

    /// SOAP request posted to `path`
    pub fn soap(path: impl Into<String>, soap_action: Option<&str>, namespace: Option<&str>) -> Self {
        let mut attrs = Self::http(Method::POST, path);
        attrs.soap = true;
        attrs.soap_action = soap_action.map(str::to_string);
        attrs.namespace = namespace.map(str::to_string);
        attrs
    }

    /// Only non-SOAP requests may fall through to the catch-all service
    pub fn eligible_for_catch_all(&self) -> bool {
        !self.soap && !self.path.is_empty()
    }
}

const SERVICE_ID_PREFIX: &str = "/service/";

fn parse_service_id_hint(path: &str) -> Option<ServiceId> {
    let rest = path.strip_prefix(SERVICE_ID_PREFIX)?;
    let digits = rest.split(|c| c == '/' || c == '?').next()?;
    digits.parse().ok().map(ServiceId)
}

/// Per-service usage counters
#[derive(Debug)]
pub struct ServiceStatistics {
    service_id: ServiceId,
    requests: AtomicU64,
    authorized: AtomicU64,
    completed: AtomicU64,
}

impl ServiceStatistics {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            requests: AtomicU64::new(0),
            authorized: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_authorized(&self) {
        self.authorized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServiceStatisticsSnapshot {
        ServiceStatisticsSnapshot {
            service_id: self.service_id,
            requests: self.requests.load(Ordering::Relaxed),
            authorized: self.authorized.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `ServiceStatistics`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatisticsSnapshot {
    pub service_id: ServiceId,
    pub requests: u64,
    pub authorized: u64,
    pub completed: u64,
}

/// Serialization of HTTP method lists as plain strings
mod methods_serde {
    use axum::http::Method;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(methods: &[Method], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let method_strings: Vec<&str> = methods.iter().map(Method::as_str).collect();
        method_strings.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Method>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let method_strings: Vec<String> = Vec::deserialize(deserializer)?;
        method_strings
            .into_iter()
            .map(|s| Method::from_str(&s.to_ascii_uppercase()).map_err(serde::de::Error::custom))
            .collect()
    }
}

mod method_serde {
    use axum::http::Method;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(method: &Method, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(method.as_str())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Method, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Method::from_str(&s.to_ascii_uppercase()).map_err(serde::de::Error::custom)
    }
}
