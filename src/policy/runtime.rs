//! # Policy Runtime Cache
//!
//! Holds the compiled form of every policy referenced by a cached service,
//! keyed by policy id, and announces validity changes on a broadcast channel.
//!
//! Operations that the service cache performs while it already holds the
//! shared lock have a `_locked` variant taking the guard as proof. The plain
//! variants acquire the shared lock themselves and are meant for callers that
//! refresh policies independently of services.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::coordination::{CrossCacheGuard, SharedCacheLock};
use crate::core::error::{ServiceCacheError, ServiceCacheResult};
use crate::core::types::{PolicyId, PolicyRecord};
use crate::policy::compiler::{CompiledPolicy, PolicyCompiler};

/// Shared handle to a compiled policy
pub type PolicyHandle = Arc<CompiledPolicy>;

/// Validity change of a cached policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PolicyEvent {
    /// The policy at `version` compiled successfully
    Valid { policy_id: PolicyId, version: u64 },
    /// The policy at `version` could not be compiled
    Invalid {
        policy_id: PolicyId,
        version: u64,
        cause: String,
    },
}

impl PolicyEvent {
    pub fn policy_id(&self) -> PolicyId {
        match self {
            Self::Valid { policy_id, .. } | Self::Invalid { policy_id, .. } => *policy_id,
        }
    }
}

#[derive(Debug, Clone)]
enum PolicyState {
    Compiled(PolicyHandle),
    Invalid { cause: String },
}

#[derive(Debug, Clone)]
struct PolicyEntry {
    version: u64,
    xml_digest: blake3::Hash,
    state: PolicyState,
}

pub struct PolicyRuntimeCache {
    lock: SharedCacheLock,
    entries: RwLock<HashMap<PolicyId, PolicyEntry>>,
    compiler: Arc<dyn PolicyCompiler>,
    events: broadcast::Sender<PolicyEvent>,
}

impl PolicyRuntimeCache {
    pub fn new(lock: SharedCacheLock, compiler: Arc<dyn PolicyCompiler>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            lock,
            entries: RwLock::new(HashMap::new()),
            compiler,
            events,
        }
    }

    pub fn shared_lock(&self) -> &SharedCacheLock {
        &self.lock
    }

    /// Subscribe to validity events
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.events.subscribe()
    }

    /// Compile and cache `policy`, taking the shared lock
    pub fn update(&self, policy: &PolicyRecord) -> ServiceCacheResult<PolicyHandle> {
        let guard = self.lock.write();
        self.update_locked(&guard, policy)
    }

    /// Compile and cache `policy` while the caller holds the shared lock
    ///
    /// Re-submitting an unchanged policy returns the cached outcome without
    /// recompiling or publishing an event.
    pub fn update_locked(&self, guard: &CrossCacheGuard<'_>, policy: &PolicyRecord) -> ServiceCacheResult<PolicyHandle> {
        debug_assert!(guard.guards(&self.lock), "policy runtime updated under a foreign lock");

        let digest = blake3::hash(policy.xml.as_bytes());
        let mut entries = self.entries.write();

        if let Some(entry) = entries.get(&policy.id) {
            if entry.version == policy.version && entry.xml_digest == digest {
                return match &entry.state {
                    PolicyState::Compiled(handle) => Ok(handle.clone()),
                    PolicyState::Invalid { cause } => Err(ServiceCacheError::policy_compile(policy.id, cause.clone())),
                };
            }
        }

        match self.compiler.compile(policy) {
            Ok(compiled) => {
                let handle = Arc::new(compiled);
                entries.insert(
                    policy.id,
                    PolicyEntry {
                        version: policy.version,
                        xml_digest: digest,
                        state: PolicyState::Compiled(handle.clone()),
                    },
                );
                debug!("Compiled policy #{} version {}", policy.id, policy.version);
                self.publish(PolicyEvent::Valid {
                    policy_id: policy.id,
                    version: policy.version,
                });
                Ok(handle)
            }
            Err(err) => {
                let cause = match &err {
                    ServiceCacheError::PolicyCompile { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                warn!("Policy #{} version {} is invalid: {}", policy.id, policy.version, cause);
                entries.insert(
                    policy.id,
                    PolicyEntry {
                        version: policy.version,
                        xml_digest: digest,
                        state: PolicyState::Invalid { cause: cause.clone() },
                    },
                );
                self.publish(PolicyEvent::Invalid {
                    policy_id: policy.id,
                    version: policy.version,
                    cause,
                });
                Err(err)
            }
        }
    }

    /// Evict a policy, taking the shared lock
    pub fn remove(&self, policy_id: PolicyId) -> bool {
        let guard = self.lock.write();
        self.remove_locked(&guard, policy_id)
    }

    pub fn remove_locked(&self, guard: &CrossCacheGuard<'_>, policy_id: PolicyId) -> bool {
        debug_assert!(guard.guards(&self.lock), "policy runtime updated under a foreign lock");
        let removed = self.entries.write().remove(&policy_id).is_some();
        if removed {
            debug!("Evicted policy #{}", policy_id);
        }
        removed
    }

    /// Compiled handle, or `None` if the policy is unknown or invalid
    pub fn get_compiled(&self, policy_id: PolicyId) -> Option<PolicyHandle> {
        match self.entries.read().get(&policy_id).map(|e| &e.state) {
            Some(PolicyState::Compiled(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Content-based version of the compiled policy, `None` unless it is valid
    pub fn unique_version_identifier(&self, policy_id: PolicyId) -> Option<String> {
        self.get_compiled(policy_id).map(|handle| handle.unique_version.clone())
    }

    /// `Some(true)` if compiled, `Some(false)` if invalid, `None` if unknown
    pub fn validity(&self, policy_id: PolicyId) -> Option<bool> {
        self.entries
            .read()
            .get(&policy_id)
            .map(|entry| matches!(entry.state, PolicyState::Compiled(_)))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn publish(&self, event: PolicyEvent) {
        // No receivers is normal before the service cache starts listening
        let _ = self.events.send(event);
    }
}
