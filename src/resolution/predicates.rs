//! # Resolution Predicates
//!
//! Each predicate is a conjunctive filter derived from one part of a service's
//! configuration. A predicate that does not apply to a service (for example a
//! SOAP-action filter against a plain HTTP service) lets that service through
//! instead of excluding it.
//!
//! ## Rust Concepts Used
//!
//! - Trait objects (`Box<dyn ResolutionPredicate>`) so the engine can hold a
//!   heterogeneous, pluggable predicate list
//! - Default trait methods for behavior most predicates share

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::types::{RequestAttributes, ServiceRecord};

/// The attribute a predicate filters on
///
/// Declaration order is the precedence used when naming the criterion of a
/// conflict: the most specific shared attribute is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionCriterion {
    Namespace,
    SoapAction,
    Uri,
    HttpMethod,
    ServiceId,
    SoapMode,
}

impl fmt::Display for ResolutionCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Namespace => "namespace",
            Self::SoapAction => "SOAP action",
            Self::Uri => "URI",
            Self::HttpMethod => "HTTP method",
            Self::ServiceId => "service id",
            Self::SoapMode => "SOAP mode",
        };
        f.write_str(name)
    }
}

pub trait ResolutionPredicate: Send + Sync {
    fn criterion(&self) -> ResolutionCriterion;

    /// Whether this predicate has anything to say about `service`
    fn applies(&self, service: &ServiceRecord) -> bool;

    /// Whether `service` accepts `request`; only called when `applies` is true
    fn matches(&self, service: &ServiceRecord, request: &RequestAttributes) -> bool;

    /// Whether some request could satisfy this predicate for both services;
    /// only called when it applies to both
    fn overlaps(&self, a: &ServiceRecord, b: &ServiceRecord) -> bool;

    /// A value both services accept, used in conflict reports
    ///
    /// Must not depend on argument order.
    fn shared_value(&self, a: &ServiceRecord, b: &ServiceRecord) -> Option<String>;

    /// Request-side predicates cannot tell two configurations apart and are
    /// left out of conflict detection
    fn participates_in_conflicts(&self) -> bool {
        true
    }
}

/// Keeps only the service named by a `/service/{id}` request
#[derive(Debug, Clone, Default)]
pub struct ServiceIdPredicate;

impl ResolutionPredicate for ServiceIdPredicate {
    fn criterion(&self) -> ResolutionCriterion {
        ResolutionCriterion::ServiceId
    }

    fn applies(&self, _service: &ServiceRecord) -> bool {
        true
    }

    fn matches(&self, service: &ServiceRecord, request: &RequestAttributes) -> bool {
        request.service_id_hint.map_or(true, |id| id == service.id)
    }

    fn overlaps(&self, _a: &ServiceRecord, _b: &ServiceRecord) -> bool {
        true
    }

    fn shared_value(&self, _a: &ServiceRecord, _b: &ServiceRecord) -> Option<String> {
        None
    }

    fn participates_in_conflicts(&self) -> bool {
        false
    }
}

/// Exact routing URI match
///
/// A SOAP service published under the catch-all URI accepts any path; its
/// SOAP predicates then do the discriminating. A request addressed by service
/// id carries no routing URI, so it is not filtered here.
#[derive(Debug, Clone)]
pub struct UriPredicate {
    catch_all_uri: String,
}

impl UriPredicate {
    pub fn new(catch_all_uri: impl Into<String>) -> Self {
        Self {
            catch_all_uri: catch_all_uri.into(),
        }
    }

    fn is_wildcard(&self, service: &ServiceRecord) -> bool {
        service.soap && service.routing_uri.as_deref() == Some(self.catch_all_uri.as_str())
    }
}

impl ResolutionPredicate for UriPredicate {
    fn criterion(&self) -> ResolutionCriterion {
        ResolutionCriterion::Uri
    }

    fn applies(&self, service: &ServiceRecord) -> bool {
        service.routing_uri.is_some()
    }

    fn matches(&self, service: &ServiceRecord, request: &RequestAttributes) -> bool {
        request.service_id_hint.is_some()
            || self.is_wildcard(service)
            || service.routing_uri.as_deref() == Some(request.path.as_str())
    }

    fn overlaps(&self, a: &ServiceRecord, b: &ServiceRecord) -> bool {
        self.is_wildcard(a) || self.is_wildcard(b) || a.routing_uri == b.routing_uri
    }

    fn shared_value(&self, a: &ServiceRecord, b: &ServiceRecord) -> Option<String> {
        match (self.is_wildcard(a), self.is_wildcard(b)) {
            (true, false) => b.routing_uri.clone(),
            (false, true) => a.routing_uri.clone(),
            _ => a.routing_uri.clone().or_else(|| b.routing_uri.clone()),
        }
    }
}

/// Accepted HTTP methods; a service listing none accepts every method
#[derive(Debug, Clone, Default)]
pub struct MethodPredicate;

impl ResolutionPredicate for MethodPredicate {
    fn criterion(&self) -> ResolutionCriterion {
        ResolutionCriterion::HttpMethod
    }

    fn applies(&self, service: &ServiceRecord) -> bool {
        !service.http_methods.is_empty()
    }

    fn matches(&self, service: &ServiceRecord, request: &RequestAttributes) -> bool {
        service.accepts_method(&request.method)
    }

    fn overlaps(&self, a: &ServiceRecord, b: &ServiceRecord) -> bool {
        a.http_methods.iter().any(|m| b.http_methods.contains(m))
    }

    fn shared_value(&self, a: &ServiceRecord, b: &ServiceRecord) -> Option<String> {
        a.http_methods
            .iter()
            .filter(|m| b.http_methods.contains(m))
            .map(|m| m.as_str().to_string())
            .min()
    }
}

/// SOAP operation named by the request's SOAPAction
#[derive(Debug, Clone, Default)]
pub struct SoapActionPredicate;

impl ResolutionPredicate for SoapActionPredicate {
    fn criterion(&self) -> ResolutionCriterion {
        ResolutionCriterion::SoapAction
    }

    fn applies(&self, service: &ServiceRecord) -> bool {
        service.soap && !service.soap_actions.is_empty()
    }

    fn matches(&self, service: &ServiceRecord, request: &RequestAttributes) -> bool {
        request
            .soap_action
            .as_ref()
            .is_some_and(|action| service.soap_actions.contains(action))
    }

    fn overlaps(&self, a: &ServiceRecord, b: &ServiceRecord) -> bool {
        common_value(&a.soap_actions, &b.soap_actions).is_some()
    }

    fn shared_value(&self, a: &ServiceRecord, b: &ServiceRecord) -> Option<String> {
        common_value(&a.soap_actions, &b.soap_actions)
    }
}

/// Target namespace of the SOAP payload
#[derive(Debug, Clone, Default)]
pub struct NamespacePredicate;

impl ResolutionPredicate for NamespacePredicate {
    fn criterion(&self) -> ResolutionCriterion {
        ResolutionCriterion::Namespace
    }

    fn applies(&self, service: &ServiceRecord) -> bool {
        service.soap && !service.namespaces.is_empty()
    }

    fn matches(&self, service: &ServiceRecord, request: &RequestAttributes) -> bool {
        request
            .namespace
            .as_ref()
            .is_some_and(|ns| service.namespaces.contains(ns))
    }

    fn overlaps(&self, a: &ServiceRecord, b: &ServiceRecord) -> bool {
        common_value(&a.namespaces, &b.namespaces).is_some()
    }

    fn shared_value(&self, a: &ServiceRecord, b: &ServiceRecord) -> Option<String> {
        common_value(&a.namespaces, &b.namespaces)
    }
}

/// Strict SOAP services only answer SOAP requests
#[derive(Debug, Clone, Default)]
pub struct SoapModePredicate;

impl ResolutionPredicate for SoapModePredicate {
    fn criterion(&self) -> ResolutionCriterion {
        ResolutionCriterion::SoapMode
    }

    fn applies(&self, service: &ServiceRecord) -> bool {
        service.soap && !service.lax_resolution
    }

    fn matches(&self, _service: &ServiceRecord, request: &RequestAttributes) -> bool {
        request.soap
    }

    fn overlaps(&self, _a: &ServiceRecord, _b: &ServiceRecord) -> bool {
        true
    }

    fn shared_value(&self, _a: &ServiceRecord, _b: &ServiceRecord) -> Option<String> {
        None
    }

    fn participates_in_conflicts(&self) -> bool {
        false
    }
}

/// Smallest value present in both lists
fn common_value(a: &[String], b: &[String]) -> Option<String> {
    a.iter().filter(|v| b.contains(v)).min().cloned()
}

/// The predicate set every engine starts with
pub fn default_predicates(catch_all_uri: &str) -> Vec<Box<dyn ResolutionPredicate>> {
    vec![
        Box::new(ServiceIdPredicate),
        Box::new(UriPredicate::new(catch_all_uri)),
        Box::new(MethodPredicate),
        Box::new(SoapActionPredicate),
        Box::new(NamespacePredicate),
        Box::new(SoapModePredicate),
    ]
}
