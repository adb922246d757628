//! # Reconciler
//!
//! Periodic integrity check that keeps the service cache eventually
//! consistent with the store, independent of commit notifications.
//!
//! ## Key Features
//! - Version-map diff: only ids whose version changed are re-read
//! - Store reads happen before any cache lock is taken
//! - All upserts and deletes of a pass applied under one write acquisition
//! - Failing versions remembered so an identical broken policy is not retried every pass
//! - "Reload completed" published at the end of every pass
//!
//! A version number is the only staleness signal. A record changed in the
//! store without a version bump is not picked up.

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ServiceCache;
use crate::core::error::ServiceCacheResult;
use crate::core::types::{ServiceId, ServiceRecord};
use crate::notifier::ReloadSummary;
use crate::store::ServiceStore;

/// Ids to re-cache and ids to drop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_upsert: Vec<ServiceId>,
    pub to_delete: Vec<ServiceId>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_upsert.is_empty() && self.to_delete.is_empty()
    }
}

/// Diff the cache's version map against the store's
pub fn plan(cache_versions: &HashMap<ServiceId, u64>, store_versions: &HashMap<ServiceId, u64>) -> ReconcilePlan {
    let mut to_upsert: Vec<ServiceId> = store_versions
        .iter()
        .filter(|(id, version)| cache_versions.get(id) != Some(version))
        .map(|(id, _)| *id)
        .collect();
    let mut to_delete: Vec<ServiceId> = cache_versions
        .keys()
        .filter(|id| !store_versions.contains_key(id))
        .copied()
        .collect();

    to_upsert.sort();
    to_delete.sort();
    ReconcilePlan { to_upsert, to_delete }
}

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub upserted: Vec<ServiceId>,
    pub deleted: Vec<ServiceId>,
    pub failed: Vec<ServiceId>,
    /// Ids left alone because their current version already failed
    pub skipped: Vec<ServiceId>,
    /// Ids changed in the cache while their records were being fetched
    pub superseded: Vec<ServiceId>,
}

impl ReconcileReport {
    pub fn summary(&self) -> ReloadSummary {
        ReloadSummary {
            upserted: self.upserted.len(),
            deleted: self.deleted.len(),
            failed: self.failed.len(),
        }
    }
}

pub struct Reconciler {
    cache: Arc<ServiceCache>,
    store: Arc<dyn ServiceStore>,
    interval: Duration,
    /// id → version whose caching failed with a policy error
    throwing: Mutex<HashMap<ServiceId, u64>>,
}

impl Reconciler {
    pub fn new(cache: Arc<ServiceCache>, store: Arc<dyn ServiceStore>, interval: Duration) -> Self {
        Self {
            cache,
            store,
            interval,
            throwing: Mutex::new(HashMap::new()),
        }
    }

    /// Versions currently remembered as failing
    pub fn throwing(&self) -> HashMap<ServiceId, u64> {
        self.throwing.lock().clone()
    }

    /// Run one integrity check
    ///
    /// A store failure abandons the pass before anything is applied. "Reload
    /// completed" is published either way, with empty counts for an abandoned pass.
    pub async fn run_once(&self) -> ServiceCacheResult<ReconcileReport> {
        let result = self.reconcile().await;
        let summary = result.as_ref().map(ReconcileReport::summary).unwrap_or_default();
        self.cache.notifier().reload_completed(summary);
        result
    }

    async fn reconcile(&self) -> ServiceCacheResult<ReconcileReport> {
        let cache_versions = self.cache.version_snapshot();
        let store_versions = self.store.find_version_map().await?;

        let mut plan = plan(&cache_versions, &store_versions);
        let mut report = ReconcileReport::default();

        {
            let mut throwing = self.throwing.lock();
            throwing.retain(|id, failed_version| store_versions.get(id) == Some(failed_version));
            plan.to_upsert.retain(|id| {
                let known_bad = throwing.contains_key(id);
                if known_bad {
                    report.skipped.push(*id);
                }
                !known_bad
            });
        }

        if !plan.is_empty() {
            let mut records: Vec<ServiceRecord> = Vec::with_capacity(plan.to_upsert.len());
            for id in &plan.to_upsert {
                match self.store.find_by_primary_key(*id).await? {
                    Some(record) => records.push(record),
                    None => debug!("Service #{} disappeared from the store during reconciliation", id),
                }
            }

            let applied = self.cache.apply_reconciliation(records, &plan.to_delete, &cache_versions);

            let mut throwing = self.throwing.lock();
            for id in &applied.upserted {
                throwing.remove(id);
            }
            for failure in &applied.failed {
                if failure.error.is_policy_error() {
                    throwing.insert(failure.service_id, failure.version);
                }
                warn!(
                    "Reconciliation could not cache service #{} version {}: {}",
                    failure.service_id, failure.version, failure.error
                );
                report.failed.push(failure.service_id);
            }
            drop(throwing);

            report.upserted = applied.upserted;
            report.deleted = applied.deleted;
            report.superseded = applied.superseded;

            counter!("service_cache_reconcile_upserts_total").increment(report.upserted.len() as u64);
            counter!("service_cache_reconcile_deletes_total").increment(report.deleted.len() as u64);
            info!(
                "Reconciliation applied {} upserts, {} deletes, {} failures",
                report.upserted.len(),
                report.deleted.len(),
                report.failed.len()
            );
        }

        Ok(report)
    }

    /// Run `run_once` every interval until the handle is stopped
    pub fn start(self: Arc<Self>) -> ReconcilerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let reconciler = self.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(reconciler.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the initial load already covered it
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = reconciler.run_once().await {
                            error!("Reconciliation pass abandoned: {}", e);
                        }
                    }
                }
            }
            debug!("Reconciler stopped");
        });

        info!("Reconciler started with a {:?} period", self.interval);
        ReconcilerHandle { cancel, task }
    }
}

/// Running reconciler task
pub struct ReconcilerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Cancel the schedule and wait for an in-flight pass to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Reconciler task terminated abnormally: {}", e);
        }
    }
}
