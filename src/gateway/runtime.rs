//! # Cache Runtime
//!
//! Composition root of the service cache subsystem. It owns the shared
//! coordination lock and hands the same handle to both caches, wires the
//! notifier and the store's commit hooks, and runs the background tasks with
//! an explicit lifecycle:
//!
//! 1. `build`: construct every component, nothing running yet except the notifier worker
//! 2. `start`: start the cache's event handler, load the cache, start the Reconciler
//! 3. `shutdown`: stop the Reconciler and the event handler, then drain the notifier

use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheSettings, ServiceCache, SharedCacheLock};
use crate::core::config::ServiceCacheConfig;
use crate::core::error::ServiceCacheResult;
use crate::notifier::{EventSink, Notifier};
use crate::policy::{BasicPolicyCompiler, PolicyCompiler, PolicyRuntimeCache};
use crate::reconciler::{Reconciler, ReconcilerHandle};
use crate::store::ServiceStore;

pub struct CacheRuntime {
    config: ServiceCacheConfig,
    policy_runtime: Arc<PolicyRuntimeCache>,
    cache: Arc<ServiceCache>,
    reconciler: Arc<Reconciler>,
    reconciler_handle: Option<ReconcilerHandle>,
}

impl CacheRuntime {
    /// Build with the basic policy compiler
    pub fn build(
        config: ServiceCacheConfig,
        store: Arc<dyn ServiceStore>,
        sink: Arc<dyn EventSink>,
    ) -> ServiceCacheResult<Self> {
        Self::build_with_compiler(config, store, sink, Arc::new(BasicPolicyCompiler))
    }

    /// Must be called from within a tokio runtime
    pub fn build_with_compiler(
        config: ServiceCacheConfig,
        store: Arc<dyn ServiceStore>,
        sink: Arc<dyn EventSink>,
        compiler: Arc<dyn PolicyCompiler>,
    ) -> ServiceCacheResult<Self> {
        config.validate()?;

        let lock = SharedCacheLock::new();
        let policy_runtime = Arc::new(PolicyRuntimeCache::new(
            lock.clone(),
            compiler,
            config.event_channel_capacity,
        ));
        let notifier = Notifier::start(sink);

        let cache = Arc::new(ServiceCache::new(
            CacheSettings {
                catch_all_uri: config.catch_all_uri.clone(),
            },
            lock,
            policy_runtime.clone(),
            store.clone(),
            notifier,
        )?);

        let reconciler = Arc::new(Reconciler::new(cache.clone(), store, config.integrity_check_interval));

        Ok(Self {
            config,
            policy_runtime,
            cache,
            reconciler,
            reconciler_handle: None,
        })
    }

    pub fn config(&self) -> &ServiceCacheConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ServiceCache> {
        &self.cache
    }

    pub fn policy_runtime(&self) -> &Arc<PolicyRuntimeCache> {
        &self.policy_runtime
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Start event handling, perform the initial load, then schedule the Reconciler
    pub async fn start(&mut self) -> ServiceCacheResult<()> {
        if self.reconciler_handle.is_some() {
            return Ok(());
        }

        self.cache.start();
        let loaded = self.cache.initialize().await?;
        self.reconciler_handle = Some(self.reconciler.clone().start());

        info!("Service cache runtime started with {} services", loaded);
        Ok(())
    }

    /// Stop background tasks and publish whatever is still queued
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.reconciler_handle.take() {
            handle.stop().await;
        }
        self.cache.stop().await;
        self.cache.notifier().stop().await;
        info!("Service cache runtime stopped");
    }
}
