//! # In-Memory Service Store
//!
//! A `ServiceStore` backed by a `DashMap`, used by the binary and the tests.
//!
//! ## Key Features
//! - Transactions buffering writes until `commit()`; dropping one rolls it back
//! - Version bumped on every committed save
//! - Commit hooks fired only after a successful commit
//! - Out-of-band writes that skip the hooks, standing in for lost notifications
//! - A switch that makes every read fail, for exercising store outages

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::error::{ServiceCacheError, ServiceCacheResult};
use crate::core::types::{ServiceId, ServiceRecord};
use crate::store::{CommitHook, ServiceStore, StoreEvent};

#[derive(Default)]
pub struct InMemoryServiceStore {
    records: DashMap<ServiceId, ServiceRecord>,
    hooks: RwLock<Vec<Arc<dyn CommitHook>>>,
    unavailable: AtomicBool,
}

impl InMemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `records`, versions kept as given
    pub fn with_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = ServiceRecord>,
    {
        let store = Self::new();
        for record in records {
            store.records.insert(record.id, record);
        }
        store
    }

    /// Load records from a YAML list of services
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> ServiceCacheResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            ServiceCacheError::store(format!("Failed to read seed file {}: {}", path.as_ref().display(), e))
        })?;
        let records: Vec<ServiceRecord> = serde_yaml::from_str(&content)?;
        info!("Seeded store with {} services", records.len());
        Ok(Self::with_records(records))
    }

    /// Start a transaction
    pub fn begin(&self) -> StoreTransaction<'_> {
        StoreTransaction {
            store: self,
            writes: Vec::new(),
        }
    }

    /// Write a record without firing commit hooks
    pub fn put_unnotified(&self, record: ServiceRecord) {
        self.records.insert(record.id, record);
    }

    /// Delete a record without firing commit hooks
    pub fn delete_unnotified(&self, id: ServiceId) -> Option<ServiceRecord> {
        self.records.remove(&id).map(|(_, record)| record)
    }

    /// Make every read fail with `StoreAccess` until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_available(&self) -> ServiceCacheResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ServiceCacheError::store("store is unavailable"))
        } else {
            Ok(())
        }
    }

    fn fire_hooks(&self, events: &[StoreEvent]) {
        let hooks = self.hooks.read().clone();
        for event in events {
            for hook in &hooks {
                hook.after_commit(event);
            }
        }
    }
}

#[async_trait]
impl ServiceStore for InMemoryServiceStore {
    async fn find_all(&self) -> ServiceCacheResult<Vec<ServiceRecord>> {
        self.check_available()?;
        let mut records: Vec<ServiceRecord> = self.records.iter().map(|e| e.value().clone()).collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn find_by_primary_key(&self, id: ServiceId) -> ServiceCacheResult<Option<ServiceRecord>> {
        self.check_available()?;
        Ok(self.records.get(&id).map(|e| e.value().clone()))
    }

    async fn find_version_map(&self) -> ServiceCacheResult<HashMap<ServiceId, u64>> {
        self.check_available()?;
        Ok(self.records.iter().map(|e| (*e.key(), e.value().version)).collect())
    }

    async fn save(&self, record: ServiceRecord) -> ServiceCacheResult<ServiceRecord> {
        let id = record.id;
        let mut tx = self.begin();
        tx.save(record);
        tx.commit()?;
        self.records
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ServiceCacheError::store(format!("service #{} vanished after commit", id)))
    }

    fn register_commit_hook(&self, hook: Arc<dyn CommitHook>) {
        self.hooks.write().push(hook);
    }
}

enum PendingWrite {
    Save(ServiceRecord),
    Delete(ServiceId),
}

/// Buffered writes against an `InMemoryServiceStore`
///
/// Nothing is visible to readers, and no hook fires, until `commit()`.
pub struct StoreTransaction<'a> {
    store: &'a InMemoryServiceStore,
    writes: Vec<PendingWrite>,
}

impl StoreTransaction<'_> {
    /// Create or update a service; the committed version is one past the stored one
    pub fn save(&mut self, record: ServiceRecord) -> &mut Self {
        self.writes.push(PendingWrite::Save(record));
        self
    }

    pub fn delete(&mut self, id: ServiceId) -> &mut Self {
        self.writes.push(PendingWrite::Delete(id));
        self
    }

    /// Apply the writes, then fire commit hooks; returns the committed events
    pub fn commit(self) -> ServiceCacheResult<Vec<StoreEvent>> {
        self.store.check_available()?;

        let mut events = Vec::with_capacity(self.writes.len());
        for write in self.writes {
            match write {
                PendingWrite::Save(mut record) => {
                    record.version = self
                        .store
                        .records
                        .get(&record.id)
                        .map(|existing| existing.version + 1)
                        .unwrap_or(record.version.max(1));
                    debug!("Committed service {} at version {}", record.display_name(), record.version);
                    let id = record.id;
                    self.store.records.insert(id, record);
                    events.push(StoreEvent::Updated(id));
                }
                PendingWrite::Delete(id) => {
                    if let Some((_, record)) = self.store.records.remove(&id) {
                        debug!("Committed deletion of service {}", record.display_name());
                        events.push(StoreEvent::Deleted(record));
                    }
                }
            }
        }

        self.store.fire_hooks(&events);
        Ok(events)
    }

    /// Discard the writes
    pub fn rollback(self) {
        debug!("Rolled back {} pending writes", self.writes.len());
    }
}
