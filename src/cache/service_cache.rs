//! # Service Cache
//!
//! The in-memory, authoritative-for-reads view of every published service.
//!
//! ## Key Features
//! - One reader/writer lock over the service map, the disabled set and the
//!   catch-all pointer, so readers always see a consistent snapshot
//! - Policy compilation under the lock shared with the policy runtime cache
//! - Disable/enable driven by policy validity events, never by clients
//! - Store commit hooks applied after the originating transaction commits
//! - Notifications handed to the notifier only after the write lock is released
//! - Lazily created per-service usage statistics
//!
//! ## Lock order
//!
//! `SharedCacheLock` (write) → cache state → statistics → policy runtime entries.
//! Readers (`get`, `resolve`, `size`, `check_resolution`) take the cache state
//! read lock alone.

use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::coordination::{CrossCacheGuard, SharedCacheLock};
use crate::core::error::{ServiceCacheError, ServiceCacheResult};
use crate::core::types::{
    PolicyId, RequestAttributes, ServiceId, ServiceRecord, ServiceStatistics, ServiceStatisticsSnapshot,
};
use crate::notifier::{AuditKind, AuditRecord, NotificationBatch, Notifier, Transition};
use crate::policy::{PolicyEvent, PolicyHandle, PolicyRuntimeCache};
use crate::resolution::{ResolutionEngine, ResolutionOutcome};
use crate::store::{CommitHook, ServiceStore, StoreEvent};

/// Settings fixed at construction
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Routing URI of the service that takes otherwise unmatched requests
    pub catch_all_uri: String,
}

/// Why a cached service is excluded from resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    /// The record itself is not enabled
    Administrative,
    /// Its policy failed to compile
    InvalidPolicy,
}

/// What `cache(...)` did with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Created,
    Updated,
    /// Identical to the cached record; nothing changed
    Unchanged,
    /// Stored, but disabled because its policy is invalid
    StoredDisabled,
}

impl CacheOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// A record that could not be cached during a bulk apply
#[derive(Debug, Clone)]
pub struct CacheFailure {
    pub service_id: ServiceId,
    pub version: u64,
    pub error: ServiceCacheError,
}

/// Result of applying a reconciliation plan
#[derive(Debug, Clone, Default)]
pub struct AppliedChanges {
    pub upserted: Vec<ServiceId>,
    pub deleted: Vec<ServiceId>,
    pub failed: Vec<CacheFailure>,
    /// Changed by someone else since the plan was computed, left as found
    pub superseded: Vec<ServiceId>,
}

/// Transforms every record before it enters the cache
pub trait ServiceDecorator: Send + Sync {
    fn decorate(&self, record: ServiceRecord) -> ServiceRecord;
}

#[derive(Default)]
struct CacheState {
    services: HashMap<ServiceId, Arc<ServiceRecord>>,
    disabled: HashMap<ServiceId, DisableReason>,
    catch_all: Option<ServiceId>,
}

impl CacheState {
    fn is_active(&self, id: ServiceId) -> bool {
        self.services.contains_key(&id) && !self.disabled.contains_key(&id)
    }

    fn find_by_policy(&self, policy_id: PolicyId) -> Option<&Arc<ServiceRecord>> {
        self.services.values().find(|s| s.policy_id() == Some(policy_id))
    }
}

pub struct ServiceCache {
    settings: CacheSettings,
    lock: SharedCacheLock,
    state: RwLock<CacheState>,
    statistics: RwLock<HashMap<ServiceId, Arc<ServiceStatistics>>>,
    policy_runtime: Arc<PolicyRuntimeCache>,
    store: Arc<dyn ServiceStore>,
    engine: ResolutionEngine,
    notifier: Notifier,
    decorators: Vec<Arc<dyn ServiceDecorator>>,
    store_events: mpsc::UnboundedSender<StoreEvent>,
    store_events_rx: Mutex<Option<mpsc::UnboundedReceiver<StoreEvent>>>,
    shutdown: CancellationToken,
    handler: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceCache {
    /// Create an empty cache
    ///
    /// `lock` must be the same handle the policy runtime cache was built with.
    pub fn new(
        settings: CacheSettings,
        lock: SharedCacheLock,
        policy_runtime: Arc<PolicyRuntimeCache>,
        store: Arc<dyn ServiceStore>,
        notifier: Notifier,
    ) -> ServiceCacheResult<Self> {
        if !lock.same_as(policy_runtime.shared_lock()) {
            return Err(ServiceCacheError::config(
                "service cache and policy runtime cache must share one coordination lock",
            ));
        }

        let engine = ResolutionEngine::new(&settings.catch_all_uri);
        let (store_events, store_events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            settings,
            lock,
            state: RwLock::new(CacheState::default()),
            statistics: RwLock::new(HashMap::new()),
            policy_runtime,
            store,
            engine,
            notifier,
            decorators: Vec::new(),
            store_events,
            store_events_rx: Mutex::new(Some(store_events_rx)),
            shutdown: CancellationToken::new(),
            handler: Mutex::new(None),
        })
    }

    pub fn with_decorator(mut self, decorator: Arc<dyn ServiceDecorator>) -> Self {
        self.decorators.push(decorator);
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn policy_runtime(&self) -> &Arc<PolicyRuntimeCache> {
        &self.policy_runtime
    }

    // ---------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------

    /// Insert or replace a service
    ///
    /// Fails with `PolicyMissing` when the record has no policy, and with
    /// `PolicyCompile` when a service that is not cached yet has an invalid
    /// policy. An already cached service with an invalid policy is stored and
    /// disabled instead.
    pub fn cache(&self, record: ServiceRecord) -> ServiceCacheResult<CacheOutcome> {
        let mut batch = NotificationBatch::new();
        let result = {
            let guard = self.lock.write();
            let mut state = self.state.write();
            let result = self.cache_locked(&guard, &mut state, record, &mut batch);
            if matches!(result, Ok(outcome) if outcome.changed()) {
                self.refresh_catch_all(&mut state);
            }
            result
        };
        self.notifier.dispatch(batch);
        result
    }

    /// Remove a service and evict its policy
    pub fn remove(&self, record: &ServiceRecord) -> Option<Arc<ServiceRecord>> {
        self.remove_by_id(record.id)
    }

    pub fn remove_by_id(&self, service_id: ServiceId) -> Option<Arc<ServiceRecord>> {
        let mut batch = NotificationBatch::new();
        let removed = {
            let guard = self.lock.write();
            let mut state = self.state.write();
            let removed = self.remove_locked(&guard, &mut state, service_id, &mut batch);
            if removed.is_some() {
                self.refresh_catch_all(&mut state);
            }
            removed
        };
        self.notifier.dispatch(batch);
        removed
    }

    /// Apply a batch of upserts and deletes under a single write acquisition
    ///
    /// `baseline` is the version snapshot the batch was planned from. An id
    /// whose cached version no longer matches it (or that appeared since) was
    /// changed concurrently with a record at least as fresh, and is skipped.
    pub fn apply_reconciliation(
        &self,
        upserts: Vec<ServiceRecord>,
        deletes: &[ServiceId],
        baseline: &HashMap<ServiceId, u64>,
    ) -> AppliedChanges {
        let mut batch = NotificationBatch::new();
        let mut applied = AppliedChanges::default();
        {
            let guard = self.lock.write();
            let mut state = self.state.write();
            let unchanged_since_plan = |state: &CacheState, id: ServiceId| {
                state.services.get(&id).map(|s| s.version) == baseline.get(&id).copied()
            };

            for record in upserts {
                let (service_id, version) = (record.id, record.version);
                if !unchanged_since_plan(&*state, service_id) {
                    debug!("Service #{} changed during reconciliation, keeping the cached record", service_id);
                    applied.superseded.push(service_id);
                    continue;
                }
                match self.cache_locked(&guard, &mut state, record, &mut batch) {
                    Ok(outcome) if outcome.changed() => applied.upserted.push(service_id),
                    Ok(_) => {}
                    Err(error) => applied.failed.push(CacheFailure {
                        service_id,
                        version,
                        error,
                    }),
                }
            }

            for &service_id in deletes {
                if !unchanged_since_plan(&*state, service_id) {
                    applied.superseded.push(service_id);
                    continue;
                }
                if self.remove_locked(&guard, &mut state, service_id, &mut batch).is_some() {
                    applied.deleted.push(service_id);
                }
            }

            self.refresh_catch_all(&mut state);
        }
        self.notifier.dispatch(batch);
        applied
    }

    /// Build the cache from the store if it is still empty
    ///
    /// Services that cannot be cached are logged and skipped; the Reconciler
    /// retries them. Returns the number of services cached.
    pub async fn initialize(&self) -> ServiceCacheResult<usize> {
        if self.size() > 0 {
            debug!("Service cache already initialized");
            return Ok(0);
        }

        let records = self.store.find_all().await?;
        let total = records.len();
        let applied = self.apply_reconciliation(records, &[], &HashMap::new());

        for failure in &applied.failed {
            warn!(
                "Service #{} version {} skipped during initial load: {}",
                failure.service_id, failure.version, failure.error
            );
        }

        info!("Service cache initialized with {} of {} services", applied.upserted.len(), total);
        Ok(applied.upserted.len())
    }

    /// Validate `record` against the cached services, then commit it to the store
    ///
    /// A resolution conflict rejects the record before anything is written.
    /// The committed record is cached right away; the commit hook that follows
    /// finds it unchanged.
    pub async fn publish(&self, record: ServiceRecord) -> ServiceCacheResult<ServiceRecord> {
        self.check_resolution(&record)?;

        let committed = self.store.save(record).await?;
        info!("Published service {} at version {}", committed.display_name(), committed.version);

        if let Err(e) = self.cache(committed.clone()) {
            warn!("Published service {} could not be cached: {}", committed.display_name(), e);
        }
        Ok(committed)
    }

    fn cache_locked(
        &self,
        guard: &CrossCacheGuard<'_>,
        state: &mut CacheState,
        record: ServiceRecord,
        batch: &mut NotificationBatch,
    ) -> ServiceCacheResult<CacheOutcome> {
        let record = self.decorate(record);
        let service_id = record.id;

        let Some(policy) = record.policy.clone() else {
            warn!("Service {} has no policy, not caching", record.display_name());
            return Err(ServiceCacheError::PolicyMissing {
                service_id,
                service_name: record.name,
            });
        };

        let existing = state.services.get(&service_id).cloned();
        if existing.as_deref() == Some(&record) {
            return Ok(CacheOutcome::Unchanged);
        }

        let was_active = state.is_active(service_id);
        let previous_reason = state.disabled.get(&service_id).copied();
        let compiled = self.policy_runtime.update_locked(guard, &policy);

        if let Some(old_policy) = existing.as_ref().and_then(|e| e.policy_id()) {
            if old_policy != policy.id {
                self.policy_runtime.remove_locked(guard, old_policy);
            }
        }

        match compiled {
            Err(err) if existing.is_none() => {
                self.policy_runtime.remove_locked(guard, policy.id);
                warn!("Service {} not cached: {}", record.display_name(), err);
                Err(err)
            }
            Err(err) => {
                let name = record.display_name();
                state.services.insert(service_id, Arc::new(record));
                state.disabled.insert(service_id, DisableReason::InvalidPolicy);
                batch.push(service_id, Transition::Updated);
                if was_active {
                    batch.push(service_id, Transition::Disabled);
                }
                if previous_reason != Some(DisableReason::InvalidPolicy) {
                    batch.audit(AuditRecord::new(
                        AuditKind::ServiceDisabled,
                        service_id,
                        format!("Service {} disabled: {}", name, err),
                    ));
                }
                warn!("Service {} cached but disabled: {}", name, err);
                Ok(CacheOutcome::StoredDisabled)
            }
            Ok(_) => {
                let created = existing.is_none();
                let name = record.display_name();
                let enabled = record.enabled;
                state.services.insert(service_id, Arc::new(record));

                let now_active = if enabled {
                    state.disabled.remove(&service_id);
                    true
                } else {
                    state.disabled.insert(service_id, DisableReason::Administrative);
                    false
                };

                if created {
                    batch.push(service_id, Transition::Created);
                    if !now_active {
                        batch.push(service_id, Transition::Disabled);
                    }
                } else {
                    batch.push(service_id, Transition::Updated);
                    if was_active != now_active {
                        batch.push(
                            service_id,
                            if now_active {
                                Transition::Enabled
                            } else {
                                Transition::Disabled
                            },
                        );
                    }
                    if now_active && previous_reason == Some(DisableReason::InvalidPolicy) {
                        batch.audit(AuditRecord::new(
                            AuditKind::ServiceEnabled,
                            service_id,
                            format!("Service {} re-enabled: policy #{} is valid", name, policy.id),
                        ));
                    }
                }

                debug!("Cached service {} ({})", name, if created { "created" } else { "updated" });
                Ok(if created {
                    CacheOutcome::Created
                } else {
                    CacheOutcome::Updated
                })
            }
        }
    }

    fn remove_locked(
        &self,
        guard: &CrossCacheGuard<'_>,
        state: &mut CacheState,
        service_id: ServiceId,
        batch: &mut NotificationBatch,
    ) -> Option<Arc<ServiceRecord>> {
        let removed = state.services.remove(&service_id)?;
        state.disabled.remove(&service_id);
        self.statistics.write().remove(&service_id);
        if let Some(policy_id) = removed.policy_id() {
            self.policy_runtime.remove_locked(guard, policy_id);
        }
        batch.push(service_id, Transition::Deleted);
        debug!("Removed service {}", removed.display_name());
        Some(removed)
    }

    fn decorate(&self, record: ServiceRecord) -> ServiceRecord {
        self.decorators.iter().fold(record, |record, d| d.decorate(record))
    }

    fn refresh_catch_all(&self, state: &mut CacheState) {
        let catch_all = state
            .services
            .values()
            .filter(|s| !s.soap && s.routing_uri.as_deref() == Some(self.settings.catch_all_uri.as_str()))
            .map(|s| s.id)
            .min();

        if catch_all != state.catch_all {
            info!("Catch-all service is now {:?}", catch_all);
            state.catch_all = catch_all;
        }
        gauge!("service_cache_services").set(state.services.len() as f64);
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub fn get(&self, service_id: ServiceId) -> Option<Arc<ServiceRecord>> {
        self.state.read().services.get(&service_id).cloned()
    }

    /// The service owning `policy_id`
    pub fn get_by_policy(&self, policy_id: PolicyId) -> Option<Arc<ServiceRecord>> {
        self.state.read().find_by_policy(policy_id).cloned()
    }

    /// Resolve a request to one enabled service
    ///
    /// Falls back to the catch-all service when nothing matches and the request
    /// is eligible. An ambiguous match is logged and resolves to nothing.
    pub fn resolve(&self, request: &RequestAttributes) -> Option<Arc<ServiceRecord>> {
        let state = self.state.read();
        let candidates = state
            .services
            .values()
            .filter(|s| !state.disabled.contains_key(&s.id))
            .map(|s| s.as_ref());

        match self.engine.resolve(request, candidates) {
            ResolutionOutcome::Matched(service) => {
                counter!("service_cache_resolutions_total", "outcome" => "matched").increment(1);
                state.services.get(&service.id).cloned()
            }
            ResolutionOutcome::NoMatch => {
                let fallback = state
                    .catch_all
                    .filter(|_| request.eligible_for_catch_all())
                    .filter(|id| !state.disabled.contains_key(id))
                    .and_then(|id| state.services.get(&id).cloned())
                    .filter(|service| service.accepts_method(&request.method));

                let outcome = if fallback.is_some() { "catch_all" } else { "no_match" };
                counter!("service_cache_resolutions_total", "outcome" => outcome).increment(1);
                fallback
            }
            ResolutionOutcome::Conflict(reports) => {
                counter!("service_cache_resolutions_total", "outcome" => "conflict").increment(1);
                for report in &reports {
                    error!(path = %request.path, "Committed services are ambiguous: {}", report);
                }
                None
            }
        }
    }

    /// Resolve a request against one service only
    pub fn resolve_for_service(&self, request: &RequestAttributes, service_id: ServiceId) -> Option<Arc<ServiceRecord>> {
        let state = self.state.read();
        if !state.is_active(service_id) {
            return None;
        }
        let service = state.services.get(&service_id)?;

        match self.engine.resolve(request, std::iter::once(service.as_ref())) {
            ResolutionOutcome::Matched(_) => Some(service.clone()),
            _ => None,
        }
    }

    /// Validate a proposed service against every cached one before it is committed
    pub fn check_resolution(&self, candidate: &ServiceRecord) -> ServiceCacheResult<()> {
        let candidate = self.decorate(candidate.clone());
        let result = {
            let state = self.state.read();
            self.engine
                .check_resolution(&candidate, state.services.values().map(|s| s.as_ref()))
        };

        match result {
            Ok(()) => Ok(()),
            Err(conflict) => {
                let mut batch = NotificationBatch::new();
                batch.audit(AuditRecord::new(
                    AuditKind::ResolutionConflict,
                    candidate.id,
                    conflict.to_string(),
                ));
                self.notifier.dispatch(batch);
                info!("Rejected service {}: {}", candidate.display_name(), conflict);
                Err(conflict.into())
            }
        }
    }

    pub fn size(&self) -> usize {
        self.state.read().services.len()
    }

    pub fn has_catch_all(&self) -> bool {
        self.state.read().catch_all.is_some()
    }

    pub fn is_disabled(&self, service_id: ServiceId) -> bool {
        self.state.read().disabled.contains_key(&service_id)
    }

    pub fn disabled_reason(&self, service_id: ServiceId) -> Option<DisableReason> {
        self.state.read().disabled.get(&service_id).copied()
    }

    /// Cached version of every service
    pub fn version_snapshot(&self) -> HashMap<ServiceId, u64> {
        self.state
            .read()
            .services
            .iter()
            .map(|(id, service)| (*id, service.version))
            .collect()
    }

    /// Compiled policy of a cached service, `None` if absent or invalid
    pub fn server_policy(&self, service_id: ServiceId) -> Option<PolicyHandle> {
        let _guard = self.lock.read();
        let policy_id = self.state.read().services.get(&service_id)?.policy_id()?;
        self.policy_runtime.get_compiled(policy_id)
    }

    /// Every cached service published under `uri`, ordered by id
    pub fn cached_services_by_uri(&self, uri: &str) -> Vec<Arc<ServiceRecord>> {
        let state = self.state.read();
        let mut services: Vec<Arc<ServiceRecord>> = state
            .services
            .values()
            .filter(|s| s.routing_uri.as_deref() == Some(uri))
            .cloned()
            .collect();
        services.sort_by_key(|s| s.id);
        services
    }

    /// Usage counters of a cached service, created on first use
    pub fn statistics(&self, service_id: ServiceId) -> Option<Arc<ServiceStatistics>> {
        let state = self.state.read();
        if !state.services.contains_key(&service_id) {
            return None;
        }

        let statistics = self.statistics.upgradable_read();
        if let Some(existing) = statistics.get(&service_id) {
            return Some(existing.clone());
        }

        let mut statistics = RwLockUpgradableReadGuard::upgrade(statistics);
        let created = statistics
            .entry(service_id)
            .or_insert_with(|| Arc::new(ServiceStatistics::new(service_id)))
            .clone();
        Some(created)
    }

    pub fn all_statistics(&self) -> Vec<ServiceStatisticsSnapshot> {
        let mut snapshots: Vec<ServiceStatisticsSnapshot> =
            self.statistics.read().values().map(|s| s.snapshot()).collect();
        snapshots.sort_by_key(|s| s.service_id);
        snapshots
    }

    // ---------------------------------------------------------------------
    // Event handling
    // ---------------------------------------------------------------------

    /// React to a policy turning valid or invalid
    pub async fn on_policy_event(&self, event: PolicyEvent) {
        match event {
            PolicyEvent::Invalid {
                policy_id,
                version,
                cause,
            } => self.disable_for_policy(policy_id, version, &cause),
            PolicyEvent::Valid { policy_id, version } => {
                let cached = {
                    let state = self.state.read();
                    state
                        .find_by_policy(policy_id)
                        .map(|s| (s.id, s.policy.as_ref().map_or(0, |p| p.version)))
                };
                let Some((service_id, cached_version)) = cached else {
                    return;
                };

                if cached_version < version {
                    self.refresh_from_store(service_id).await;
                } else if cached_version == version {
                    self.enable_for_policy(policy_id, version);
                }
            }
        }
    }

    fn disable_for_policy(&self, policy_id: PolicyId, version: u64, cause: &str) {
        let mut batch = NotificationBatch::new();
        {
            let _guard = self.lock.write();
            let mut state = self.state.write();

            let Some(service) = state.find_by_policy(policy_id).cloned() else {
                return;
            };
            let cached_version = service.policy.as_ref().map_or(0, |p| p.version);
            if cached_version > version || state.disabled.contains_key(&service.id) {
                return;
            }

            state.disabled.insert(service.id, DisableReason::InvalidPolicy);
            batch.push(service.id, Transition::Disabled);
            batch.audit(AuditRecord::new(
                AuditKind::ServiceDisabled,
                service.id,
                format!("Service {} disabled: policy #{} is invalid: {}", service.display_name(), policy_id, cause),
            ));
            warn!("Disabled service {}: policy #{} is invalid", service.display_name(), policy_id);
        }
        self.notifier.dispatch(batch);
    }

    fn enable_for_policy(&self, policy_id: PolicyId, version: u64) {
        let mut batch = NotificationBatch::new();
        {
            let _guard = self.lock.write();
            let mut state = self.state.write();

            let Some(service) = state.find_by_policy(policy_id).cloned() else {
                return;
            };
            let cached_version = service.policy.as_ref().map_or(0, |p| p.version);
            if cached_version != version || state.disabled.get(&service.id) != Some(&DisableReason::InvalidPolicy) {
                return;
            }

            state.disabled.remove(&service.id);
            batch.push(service.id, Transition::Enabled);
            batch.audit(AuditRecord::new(
                AuditKind::ServiceEnabled,
                service.id,
                format!("Service {} re-enabled: policy #{} is valid", service.display_name(), policy_id),
            ));
            info!("Re-enabled service {}", service.display_name());
        }
        self.notifier.dispatch(batch);
    }

    async fn refresh_from_store(&self, service_id: ServiceId) {
        match self.store.find_by_primary_key(service_id).await {
            Ok(Some(record)) => {
                if let Err(e) = self.cache(record) {
                    warn!("Failed to refresh service #{}: {}", service_id, e);
                }
            }
            Ok(None) => {
                self.remove_by_id(service_id);
            }
            Err(e) => warn!("Failed to read service #{} from store: {}", service_id, e),
        }
    }

    /// Apply a committed store change
    pub async fn handle_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::Updated(service_id) => self.refresh_from_store(service_id).await,
            StoreEvent::Deleted(record) => {
                self.remove(&record);
            }
        }
    }

    /// Hook that forwards committed store changes to this cache
    pub fn commit_hook(&self) -> Arc<dyn CommitHook> {
        Arc::new(ServiceCacheCommitHook {
            sender: self.store_events.clone(),
        })
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Register the commit hook and start the event handler task
    pub fn start(self: &Arc<Self>) {
        let Some(mut store_events) = self.store_events_rx.lock().take() else {
            warn!("Service cache event handler already started");
            return;
        };

        self.store.register_commit_hook(self.commit_hook());

        let mut policy_events = self.policy_runtime.subscribe();
        let shutdown = self.shutdown.clone();
        let cache = Arc::clone(self);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = policy_events.recv() => match event {
                        Ok(event) => cache.on_policy_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Service cache missed {} policy events", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    Some(event) = store_events.recv() => cache.handle_store_event(event).await,
                }
            }
            debug!("Service cache event handler stopped");
        });

        *self.handler.lock() = Some(handle);
        info!("Service cache event handler started");
    }

    /// Stop the event handler task
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.handler.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Service cache event handler terminated abnormally: {}", e);
            }
        }
    }
}

struct ServiceCacheCommitHook {
    sender: mpsc::UnboundedSender<StoreEvent>,
}

impl CommitHook for ServiceCacheCommitHook {
    fn after_commit(&self, event: &StoreEvent) {
        if self.sender.send(event.clone()).is_err() {
            debug!("Service cache is gone, dropping store event for #{}", event.service_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PolicyRecord;
    use crate::notifier::{BroadcastEventSink, CacheEvent};
    use crate::policy::BasicPolicyCompiler;
    use crate::store::InMemoryServiceStore;
    use axum::http::Method;

    fn build() -> (ServiceCache, Arc<BroadcastEventSink>) {
        let lock = SharedCacheLock::new();
        let runtime = Arc::new(PolicyRuntimeCache::new(lock.clone(), Arc::new(BasicPolicyCompiler), 64));
        let sink = Arc::new(BroadcastEventSink::new(256));
        let notifier = Notifier::start(sink.clone());
        let cache = ServiceCache::new(
            CacheSettings {
                catch_all_uri: "/*".to_string(),
            },
            lock,
            runtime,
            Arc::new(InMemoryServiceStore::new()),
            notifier,
        )
        .unwrap();
        (cache, sink)
    }

    fn service(id: u64, uri: &str) -> ServiceRecord {
        ServiceRecord::new(ServiceId(id), format!("svc-{}", id), Some(uri))
            .with_policy(PolicyRecord::new(PolicyId(100 + id), 1, "<policy/>"))
    }

    #[tokio::test]
    async fn test_rejects_foreign_lock() {
        let runtime = Arc::new(PolicyRuntimeCache::new(
            SharedCacheLock::new(),
            Arc::new(BasicPolicyCompiler),
            8,
        ));
        let result = ServiceCache::new(
            CacheSettings {
                catch_all_uri: "/*".to_string(),
            },
            SharedCacheLock::new(),
            runtime,
            Arc::new(InMemoryServiceStore::new()),
            Notifier::start(Arc::new(BroadcastEventSink::new(8))),
        );
        assert!(matches!(result, Err(ServiceCacheError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_policy_missing_is_rejected() {
        let (cache, _) = build();
        let record = ServiceRecord::new(ServiceId(1), "bare", Some("/bare"));

        let err = cache.cache(record).unwrap_err();
        assert!(matches!(err, ServiceCacheError::PolicyMissing { .. }));
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_new_service_with_invalid_policy_stays_absent() {
        let (cache, _) = build();
        let record = ServiceRecord::new(ServiceId(1), "broken", Some("/broken"))
            .with_policy(PolicyRecord::new(PolicyId(1), 1, "<unclosed>"));

        assert!(matches!(cache.cache(record), Err(ServiceCacheError::PolicyCompile { .. })));
        assert!(cache.get(ServiceId(1)).is_none());
        assert!(cache.policy_runtime().is_empty());
    }

    #[tokio::test]
    async fn test_existing_service_with_invalid_policy_is_disabled() {
        let (cache, _) = build();
        cache.cache(service(1, "/foo")).unwrap();

        let broken = service(1, "/foo")
            .with_version(2)
            .with_policy(PolicyRecord::new(PolicyId(101), 2, "<policy>"));
        assert_eq!(cache.cache(broken).unwrap(), CacheOutcome::StoredDisabled);

        assert_eq!(cache.get(ServiceId(1)).unwrap().version, 2);
        assert_eq!(cache.disabled_reason(ServiceId(1)), Some(DisableReason::InvalidPolicy));
        assert!(cache.resolve(&RequestAttributes::http(Method::GET, "/foo")).is_none());
        assert!(cache.server_policy(ServiceId(1)).is_none());
    }

    #[tokio::test]
    async fn test_administratively_disabled_service_is_not_resolved() {
        let (cache, sink) = build();
        let mut events = sink.subscribe();

        cache.cache(service(1, "/foo").with_enabled(false)).unwrap();
        assert_eq!(cache.disabled_reason(ServiceId(1)), Some(DisableReason::Administrative));
        assert!(cache.resolve(&RequestAttributes::http(Method::GET, "/foo")).is_none());

        cache.cache(service(1, "/foo").with_version(2)).unwrap();
        assert!(!cache.is_disabled(ServiceId(1)));
        assert!(cache.resolve(&RequestAttributes::http(Method::GET, "/foo")).is_some());

        cache.notifier().flush().await;
        let mut enablements = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CacheEvent::Enablement { enabled, .. } = event {
                enablements.push(enabled);
            }
        }
        assert_eq!(enablements, vec![false, true]);
    }

    #[tokio::test]
    async fn test_catch_all_fallback() {
        let (cache, _) = build();
        cache.cache(service(1, "/orders")).unwrap();
        cache.cache(service(9, "/*")).unwrap();
        cache.cache(service(5, "/*")).unwrap();
        assert!(cache.has_catch_all());

        let fallback = cache.resolve(&RequestAttributes::http(Method::GET, "/unknown")).unwrap();
        assert_eq!(fallback.id, ServiceId(5));

        assert!(cache
            .resolve(&RequestAttributes::soap("/unknown", Some("urn:op"), None))
            .is_none());

        cache.remove_by_id(ServiceId(5));
        assert_eq!(
            cache.resolve(&RequestAttributes::http(Method::GET, "/unknown")).unwrap().id,
            ServiceId(9)
        );

        cache.remove_by_id(ServiceId(9));
        assert!(!cache.has_catch_all());
    }

    #[tokio::test]
    async fn test_strict_soap_service_ignores_plain_requests() {
        let (cache, _) = build();
        let strict = service(1, "/ws").with_soap(vec!["urn:op".into()], vec![]);
        cache.cache(strict).unwrap();

        assert!(cache
            .resolve(&RequestAttributes::soap("/ws", Some("urn:op"), None))
            .is_some());
        assert!(cache.resolve(&RequestAttributes::http(Method::POST, "/ws")).is_none());

        let lax = service(2, "/lax").with_soap(vec![], vec![]).with_lax_resolution(true);
        cache.cache(lax).unwrap();
        assert!(cache.resolve(&RequestAttributes::http(Method::GET, "/lax")).is_some());
    }

    #[tokio::test]
    async fn test_resolve_for_service() {
        let (cache, _) = build();
        cache.cache(service(1, "/a")).unwrap();
        cache.cache(service(2, "/b")).unwrap();

        let request = RequestAttributes::http(Method::GET, "/a");
        assert!(cache.resolve_for_service(&request, ServiceId(1)).is_some());
        assert!(cache.resolve_for_service(&request, ServiceId(2)).is_none());
        assert!(cache.resolve_for_service(&request, ServiceId(3)).is_none());

        let by_id = cache.resolve(&RequestAttributes::http(Method::GET, "/service/2")).unwrap();
        assert_eq!(by_id.id, ServiceId(2));
    }

    #[tokio::test]
    async fn test_policy_change_evicts_previous_policy() {
        let (cache, _) = build();
        cache.cache(service(1, "/a")).unwrap();
        assert!(cache.policy_runtime().get_compiled(PolicyId(101)).is_some());

        let moved = service(1, "/a")
            .with_version(2)
            .with_policy(PolicyRecord::new(PolicyId(500), 1, "<policy/>"));
        cache.cache(moved).unwrap();

        assert!(cache.policy_runtime().get_compiled(PolicyId(101)).is_none());
        assert_eq!(cache.server_policy(ServiceId(1)).unwrap().policy_id, PolicyId(500));
        assert_eq!(cache.get_by_policy(PolicyId(500)).unwrap().id, ServiceId(1));
    }

    #[tokio::test]
    async fn test_statistics_follow_service_lifetime() {
        let (cache, _) = build();
        assert!(cache.statistics(ServiceId(1)).is_none());

        cache.cache(service(1, "/a")).unwrap();
        let stats = cache.statistics(ServiceId(1)).unwrap();
        stats.record_request();
        assert!(Arc::ptr_eq(&stats, &cache.statistics(ServiceId(1)).unwrap()));
        assert_eq!(cache.all_statistics()[0].requests, 1);

        cache.remove_by_id(ServiceId(1));
        assert!(cache.all_statistics().is_empty());
    }

    #[tokio::test]
    async fn test_decorators_apply_before_caching() {
        struct Internalize;
        impl ServiceDecorator for Internalize {
            fn decorate(&self, mut record: ServiceRecord) -> ServiceRecord {
                record.internal = true;
                record
            }
        }

        let (cache, _) = build();
        let cache = cache.with_decorator(Arc::new(Internalize));
        cache.cache(service(1, "/a")).unwrap();
        assert!(cache.get(ServiceId(1)).unwrap().internal);

        // Decorated input equals the cached record, so nothing changes
        assert_eq!(cache.cache(service(1, "/a")).unwrap(), CacheOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_cached_services_by_uri() {
        let (cache, _) = build();
        cache.cache(service(2, "/shared").with_methods(vec![Method::GET])).unwrap();
        cache.cache(service(1, "/shared").with_methods(vec![Method::POST])).unwrap();
        cache.cache(service(3, "/other")).unwrap();

        let ids: Vec<ServiceId> = cache.cached_services_by_uri("/shared").iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![ServiceId(1), ServiceId(2)]);
    }
}
