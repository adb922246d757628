//! # Service Store
//!
//! The durable store collaborator. The cache reads from it and publishes
//! validated services through `save`; every write goes through a store
//! transaction, and the cache learns about it from commit hooks that fire
//! after the transaction commits.

pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::error::ServiceCacheResult;
use crate::core::types::{ServiceId, ServiceRecord};

pub use memory::{InMemoryServiceStore, StoreTransaction};

/// Access to persisted services
#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn find_all(&self) -> ServiceCacheResult<Vec<ServiceRecord>>;

    async fn find_by_primary_key(&self, id: ServiceId) -> ServiceCacheResult<Option<ServiceRecord>>;

    /// Current version of every stored service
    async fn find_version_map(&self) -> ServiceCacheResult<HashMap<ServiceId, u64>>;

    /// Commit `record` in its own transaction and return it at its committed version
    async fn save(&self, record: ServiceRecord) -> ServiceCacheResult<ServiceRecord>;

    /// Register a hook called after every committed change
    fn register_commit_hook(&self, hook: Arc<dyn CommitHook>);
}

/// A committed change to one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Created or updated; the record must be re-read to get the committed version
    Updated(ServiceId),
    Deleted(ServiceRecord),
}

impl StoreEvent {
    pub fn service_id(&self) -> ServiceId {
        match self {
            Self::Updated(id) => *id,
            Self::Deleted(record) => record.id,
        }
    }
}

/// Called by the store after a transaction has committed
///
/// Hooks run on the committing thread and must not block.
pub trait CommitHook: Send + Sync {
    fn after_commit(&self, event: &StoreEvent);
}
