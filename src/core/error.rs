//! # Error Handling Module
//!
//! Every fallible operation in the service cache returns `ServiceCacheResult<T>`.
//! The variants mirror how each failure is handled:
//!
//! - `PolicyMissing`: a record without a policy is rejected by `cache(...)`; nothing else changes
//! - `PolicyCompile`: the policy runtime could not build an executable plan; the owning
//!   service is disabled rather than the error reaching request processing
//! - `StoreAccess`: the durable store failed; a reconciliation pass is abandoned and retried
//! - `ResolutionConflict`: a proposed service collides with an existing one
//!
//! Errors also map onto HTTP responses for the admin facade.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::core::types::{PolicyId, ServiceId};
use crate::resolution::ResolutionConflict;

/// Result alias used throughout the crate
pub type ServiceCacheResult<T> = Result<T, ServiceCacheError>;

#[derive(Debug, Error, Clone)]
pub enum ServiceCacheError {
    /// The service record has no policy attached
    #[error("Service {service_name} [#{service_id}] has no policy")]
    PolicyMissing {
        service_id: ServiceId,
        service_name: String,
    },

    /// The policy runtime failed to compile a policy
    #[error("Policy #{policy_id} could not be compiled: {reason}")]
    PolicyCompile { policy_id: PolicyId, reason: String },

    /// Reading from the durable store failed
    #[error("Store access failed: {message}")]
    StoreAccess { message: String },

    /// Resolution attributes of a service collide with another cached service
    #[error("{0}")]
    ResolutionConflict(ResolutionConflict),

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("JSON error: {message}")]
    Json { message: String },

    #[error("YAML error: {message}")]
    Yaml { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ServiceCacheError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::StoreAccess {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn policy_compile<S: Into<String>>(policy_id: PolicyId, reason: S) -> Self {
        Self::PolicyCompile {
            policy_id,
            reason: reason.into(),
        }
    }

    /// Policy errors are the ones the Reconciler remembers per version
    pub fn is_policy_error(&self) -> bool {
        matches!(self, Self::PolicyMissing { .. } | Self::PolicyCompile { .. })
    }

    /// HTTP status for the admin facade
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PolicyMissing { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PolicyCompile { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::StoreAccess { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ResolutionConflict(_) => StatusCode::CONFLICT,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::PolicyMissing { .. } => "policy_missing",
            Self::PolicyCompile { .. } => "policy_compile_error",
            Self::StoreAccess { .. } => "store_access_error",
            Self::ResolutionConflict(_) => "resolution_conflict",
            Self::NotFound { .. } => "not_found",
            Self::Configuration { .. } => "configuration_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<ResolutionConflict> for ServiceCacheError {
    fn from(conflict: ResolutionConflict) -> Self {
        Self::ResolutionConflict(conflict)
    }
}

impl From<std::io::Error> for ServiceCacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ServiceCacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for ServiceCacheError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Structured JSON error body for the admin facade
///
/// Conflicts carry their full report list so an administrator can see which
/// services collide and on what criterion.
impl IntoResponse for ServiceCacheError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let conflicts = match &self {
            Self::ResolutionConflict(conflict) => serde_json::to_value(&conflict.reports).unwrap_or_default(),
            _ => serde_json::Value::Null,
        };

        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "conflicts": conflicts,
            }
        });

        (status, Json(body)).into_response()
    }
}
