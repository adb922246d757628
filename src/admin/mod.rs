//! # Admin Facade
//!
//! HTTP endpoints through which administrators inspect the service cache and
//! validate services before publishing them.
//!
//! | Method | Path | Operation |
//! |---|---|---|
//! | GET | `/services?uri=` | services published under a routing URI |
//! | POST | `/services` | validate and publish a service |
//! | GET | `/services/count` | cache size and catch-all presence |
//! | GET | `/services/statistics` | usage counters of every service |
//! | GET | `/services/:service_id` | one cached service and its state |
//! | GET | `/services/:service_id/statistics` | usage counters of one service |
//! | POST | `/services/check-resolution` | pre-commit conflict check |
//! | POST | `/resolve?service_id=` | resolve request attributes |
//!
//! ## Security Considerations
//! The facade can publish services and discloses the full service
//! configuration; it should only be bound to an admin network.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::cache::{DisableReason, ServiceCache};
use crate::core::error::{ServiceCacheError, ServiceCacheResult};
use crate::core::types::{RequestAttributes, ServiceId, ServiceRecord, ServiceStatisticsSnapshot};

/// Shared state of the admin handlers
#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<ServiceCache>,
}

pub struct AdminRouter;

impl AdminRouter {
    /// Create the admin router with all endpoints
    pub fn create_router(state: AdminState) -> Router {
        Router::new()
            .route("/services", get(list_services_by_uri).post(publish_service))
            .route("/services/count", get(cache_size))
            .route("/services/statistics", get(all_statistics))
            .route("/services/check-resolution", post(check_resolution))
            .route("/services/:service_id", get(get_service))
            .route("/services/:service_id/statistics", get(service_statistics))
            .route("/resolve", post(resolve))
            .with_state(state)
    }
}

/// A cached service with its resolution state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceView {
    pub service: ServiceRecord,
    pub enabled_for_resolution: bool,
    pub disabled_reason: Option<DisableReason>,
    /// Content version of the compiled policy, absent while it is invalid
    pub policy_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSizeResponse {
    pub size: usize,
    pub has_catch_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub matched: bool,
    pub service: Option<ServiceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResolutionResponse {
    pub service_id: ServiceId,
    pub conflicts: usize,
}

#[derive(Debug, Deserialize)]
pub struct UriQuery {
    pub uri: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub service_id: Option<u64>,
}

async fn list_services_by_uri(
    State(state): State<AdminState>,
    Query(query): Query<UriQuery>,
) -> Json<Vec<ServiceRecord>> {
    let services = state
        .cache
        .cached_services_by_uri(&query.uri)
        .into_iter()
        .map(|s| (*s).clone())
        .collect();
    Json(services)
}

async fn cache_size(State(state): State<AdminState>) -> Json<CacheSizeResponse> {
    Json(CacheSizeResponse {
        size: state.cache.size(),
        has_catch_all: state.cache.has_catch_all(),
    })
}

async fn get_service(
    State(state): State<AdminState>,
    Path(service_id): Path<u64>,
) -> ServiceCacheResult<Json<ServiceView>> {
    let id = ServiceId(service_id);
    let service = state
        .cache
        .get(id)
        .ok_or_else(|| ServiceCacheError::not_found(format!("service #{}", id)))?;

    let disabled_reason = state.cache.disabled_reason(id);
    let policy_version = service
        .policy_id()
        .and_then(|policy_id| state.cache.policy_runtime().unique_version_identifier(policy_id));

    Ok(Json(ServiceView {
        service: (*service).clone(),
        enabled_for_resolution: disabled_reason.is_none(),
        disabled_reason,
        policy_version,
    }))
}

async fn service_statistics(
    State(state): State<AdminState>,
    Path(service_id): Path<u64>,
) -> ServiceCacheResult<Json<ServiceStatisticsSnapshot>> {
    let id = ServiceId(service_id);
    state
        .cache
        .statistics(id)
        .map(|stats| Json(stats.snapshot()))
        .ok_or_else(|| ServiceCacheError::not_found(format!("service #{}", id)))
}

async fn all_statistics(State(state): State<AdminState>) -> Json<Vec<ServiceStatisticsSnapshot>> {
    Json(state.cache.all_statistics())
}

async fn resolve(
    State(state): State<AdminState>,
    Query(query): Query<ResolveQuery>,
    Json(request): Json<RequestAttributes>,
) -> Json<ResolveResponse> {
    let service = match query.service_id {
        Some(id) => state.cache.resolve_for_service(&request, ServiceId(id)),
        None => state.cache.resolve(&request),
    };
    debug!("Admin resolve of {} matched {:?}", request.path, service.as_ref().map(|s| s.id));

    Json(ResolveResponse {
        matched: service.is_some(),
        service: service.map(|s| (*s).clone()),
    })
}

async fn check_resolution(
    State(state): State<AdminState>,
    Json(candidate): Json<ServiceRecord>,
) -> ServiceCacheResult<Json<CheckResolutionResponse>> {
    state.cache.check_resolution(&candidate)?;
    Ok(Json(CheckResolutionResponse {
        service_id: candidate.id,
        conflicts: 0,
    }))
}

async fn publish_service(
    State(state): State<AdminState>,
    Json(record): Json<ServiceRecord>,
) -> ServiceCacheResult<(StatusCode, Json<ServiceRecord>)> {
    let committed = state.cache.publish(record).await?;
    Ok((StatusCode::CREATED, Json(committed)))
}
