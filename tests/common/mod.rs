//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gateway_service_cache::cache::{CacheSettings, ServiceCache, SharedCacheLock};
use gateway_service_cache::notifier::{BroadcastEventSink, CacheEvent, Notifier};
use gateway_service_cache::policy::{BasicPolicyCompiler, PolicyRuntimeCache};
use gateway_service_cache::store::InMemoryServiceStore;
use gateway_service_cache::{PolicyId, PolicyRecord, ServiceId, ServiceRecord};
use tokio::sync::broadcast;

pub struct Harness {
    pub lock: SharedCacheLock,
    pub policy_runtime: Arc<PolicyRuntimeCache>,
    pub cache: Arc<ServiceCache>,
    pub store: Arc<InMemoryServiceStore>,
    pub sink: Arc<BroadcastEventSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(InMemoryServiceStore::new())
    }

    pub fn with_store(store: InMemoryServiceStore) -> Self {
        let lock = SharedCacheLock::new();
        let policy_runtime = Arc::new(PolicyRuntimeCache::new(lock.clone(), Arc::new(BasicPolicyCompiler), 1024));
        let sink = Arc::new(BroadcastEventSink::new(4096));
        let store = Arc::new(store);

        let cache = ServiceCache::new(
            CacheSettings {
                catch_all_uri: "/*".to_string(),
            },
            lock.clone(),
            policy_runtime.clone(),
            store.clone(),
            Notifier::start(sink.clone()),
        )
        .expect("cache construction");

        Self {
            lock,
            policy_runtime,
            cache: Arc::new(cache),
            store,
            sink,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.sink.subscribe()
    }
}

/// Policy id of the service built by `service(id, ..)`
pub fn policy_id(service_id: u64) -> PolicyId {
    PolicyId(1000 + service_id)
}

/// Enabled plain HTTP service with a valid policy at `policy_version`
pub fn service(id: u64, uri: &str, policy_version: u64) -> ServiceRecord {
    ServiceRecord::new(ServiceId(id), format!("service-{}", id), Some(uri))
        .with_policy(valid_policy(id, policy_version))
}

pub fn valid_policy(service_id: u64, version: u64) -> PolicyRecord {
    PolicyRecord::new(
        policy_id(service_id),
        version,
        format!("<policy><revision>{}</revision></policy>", version),
    )
}

pub fn invalid_policy(service_id: u64, version: u64) -> PolicyRecord {
    PolicyRecord::new(policy_id(service_id), version, "<policy><unterminated>")
}

/// Everything received so far
pub fn drain(rx: &mut broadcast::Receiver<CacheEvent>) -> Vec<CacheEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
