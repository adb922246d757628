//! Integrity check between the cache and the store.

mod common;

use axum::http::Method;
use common::{drain, eventually, invalid_policy, policy_id, service, Harness};
use gateway_service_cache::notifier::{CacheEvent, ReloadSummary};
use gateway_service_cache::reconciler::Reconciler;
use gateway_service_cache::store::{CommitHook, InMemoryServiceStore, ServiceStore};
use gateway_service_cache::{RequestAttributes, ServiceCache, ServiceCacheError, ServiceCacheResult, ServiceId, ServiceRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn reconciler(h: &Harness) -> Reconciler {
    let store: Arc<dyn ServiceStore> = h.store.clone();
    Reconciler::new(h.cache.clone(), store, Duration::from_secs(4))
}

fn versions(pairs: &[(u64, u64)]) -> HashMap<ServiceId, u64> {
    pairs.iter().map(|(id, v)| (ServiceId(*id), *v)).collect()
}

#[tokio::test]
async fn reconciliation_upserts_changed_and_deletes_missing() {
    let store = InMemoryServiceStore::with_records(vec![
        service(1, "/one", 1).with_version(5),
        service(3, "/three", 1).with_version(2),
    ]);
    let h = Harness::with_store(store);
    h.cache.cache(service(1, "/one-old", 1).with_version(4)).unwrap();
    h.cache.cache(service(4, "/four", 1)).unwrap();

    let report = assert_ok!(reconciler(&h).run_once().await);

    assert_eq!(report.upserted, vec![ServiceId(1), ServiceId(3)]);
    assert_eq!(report.deleted, vec![ServiceId(4)]);
    assert!(report.failed.is_empty());
    assert_eq!(h.cache.version_snapshot(), versions(&[(1, 5), (3, 2)]));
    assert_eq!(h.cache.get(ServiceId(1)).unwrap().routing_uri.as_deref(), Some("/one"));
    assert!(h.policy_runtime.get_compiled(policy_id(4)).is_none());
}

#[tokio::test]
async fn repeated_passes_converge_on_the_store() {
    let store =
        InMemoryServiceStore::with_records((1..=6).map(|id| service(id, &format!("/s{}", id), 1).with_version(id * 3)));
    let h = Harness::with_store(store);
    for id in [2, 4, 7, 9] {
        h.cache.cache(service(id, &format!("/s{}", id), 1)).unwrap();
    }

    let reconciler = reconciler(&h);
    let mut passes = 0;
    loop {
        let report = reconciler.run_once().await.unwrap();
        passes += 1;
        if report.upserted.is_empty() && report.deleted.is_empty() {
            break;
        }
        assert!(passes < 5, "reconciliation did not converge");
    }

    let expected = h.store.find_version_map().await.unwrap();
    assert_eq!(h.cache.version_snapshot(), expected);
    assert_eq!(passes, 2);
}

#[tokio::test]
async fn failing_version_is_not_retried_until_it_changes() {
    let store = InMemoryServiceStore::with_records(vec![service(7, "/seven", 1).with_policy(invalid_policy(7, 1))]);
    let h = Harness::with_store(store);
    let reconciler = reconciler(&h);

    let first = reconciler.run_once().await.unwrap();
    assert_eq!(first.failed, vec![ServiceId(7)]);
    assert_eq!(reconciler.throwing(), versions(&[(7, 1)]));
    assert!(h.cache.get(ServiceId(7)).is_none());

    let second = reconciler.run_once().await.unwrap();
    assert!(second.failed.is_empty());
    assert_eq!(second.skipped, vec![ServiceId(7)]);

    h.store.put_unnotified(service(7, "/seven", 2).with_version(2));
    let third = reconciler.run_once().await.unwrap();
    assert_eq!(third.upserted, vec![ServiceId(7)]);
    assert!(reconciler.throwing().is_empty());
    assert!(h.cache.resolve(&RequestAttributes::http(Method::GET, "/seven")).is_some());
}

#[tokio::test]
async fn store_failure_abandons_the_pass() {
    let h = Harness::new();
    let mut events = h.events();
    h.cache.cache(service(1, "/one", 1)).unwrap();
    h.store.set_unavailable(true);

    let err = assert_err!(reconciler(&h).run_once().await);
    assert!(matches!(err, ServiceCacheError::StoreAccess { .. }));
    assert_eq!(h.cache.size(), 1);

    h.cache.notifier().flush().await;
    let reloads: Vec<CacheEvent> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, CacheEvent::ReloadCompleted(_)))
        .collect();
    assert_eq!(reloads, vec![CacheEvent::ReloadCompleted(ReloadSummary::default())]);
}

#[tokio::test]
async fn every_pass_reports_reload_completed() {
    let store = InMemoryServiceStore::with_records(vec![service(1, "/one", 1)]);
    let h = Harness::with_store(store);
    let mut events = h.events();
    let reconciler = reconciler(&h);

    reconciler.run_once().await.unwrap();
    let idle = reconciler.run_once().await.unwrap();
    assert!(idle.upserted.is_empty() && idle.deleted.is_empty());

    h.cache.notifier().flush().await;
    let reloads: Vec<ReloadSummary> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            CacheEvent::ReloadCompleted(summary) => Some(summary),
            _ => None,
        })
        .collect();
    assert_eq!(
        reloads,
        vec![
            ReloadSummary {
                upserted: 1,
                deleted: 0,
                failed: 0
            },
            ReloadSummary::default()
        ]
    );
}

#[tokio::test]
async fn scheduled_reconciler_repairs_lost_notifications() {
    let h = Harness::new();
    let store: Arc<dyn ServiceStore> = h.store.clone();
    let reconciler = Arc::new(Reconciler::new(h.cache.clone(), store, Duration::from_millis(20)));
    let handle = reconciler.start();

    h.store.put_unnotified(service(5, "/five", 1));
    let cache = h.cache.clone();
    assert!(eventually(|| {
        let cache = cache.clone();
        async move { cache.get(ServiceId(5)).is_some() }
    })
    .await);

    h.store.delete_unnotified(ServiceId(5));
    let cache = h.cache.clone();
    assert!(eventually(|| {
        let cache = cache.clone();
        async move { cache.size() == 0 }
    })
    .await);

    handle.stop().await;
}

/// Store whose record fetch lets a newer version reach the cache first
struct RacingStore {
    inner: Arc<InMemoryServiceStore>,
    cache: Arc<ServiceCache>,
    newer: ServiceRecord,
}

#[async_trait::async_trait]
impl ServiceStore for RacingStore {
    async fn find_all(&self) -> ServiceCacheResult<Vec<ServiceRecord>> {
        self.inner.find_all().await
    }

    async fn find_by_primary_key(&self, id: ServiceId) -> ServiceCacheResult<Option<ServiceRecord>> {
        if id == self.newer.id {
            self.cache.cache(self.newer.clone())?;
        }
        self.inner.find_by_primary_key(id).await
    }

    async fn find_version_map(&self) -> ServiceCacheResult<HashMap<ServiceId, u64>> {
        self.inner.find_version_map().await
    }

    async fn save(&self, record: ServiceRecord) -> ServiceCacheResult<ServiceRecord> {
        self.inner.save(record).await
    }

    fn register_commit_hook(&self, hook: Arc<dyn CommitHook>) {
        self.inner.register_commit_hook(hook);
    }
}

#[tokio::test]
async fn newer_version_cached_during_fetch_is_not_overwritten() {
    let store = InMemoryServiceStore::with_records(vec![service(1, "/one", 1).with_version(5)]);
    let h = Harness::with_store(store);
    h.cache.cache(service(1, "/one", 1).with_version(4)).unwrap();

    let racing = RacingStore {
        inner: h.store.clone(),
        cache: h.cache.clone(),
        newer: service(1, "/one-newer", 2).with_version(6),
    };
    let reconciler = Reconciler::new(h.cache.clone(), Arc::new(racing), Duration::from_secs(4));

    let report = assert_ok!(reconciler.run_once().await);

    assert_eq!(report.superseded, vec![ServiceId(1)]);
    assert!(report.upserted.is_empty());
    let cached = h.cache.get(ServiceId(1)).unwrap();
    assert!(cached.version >= 6);
    assert_eq!(cached.routing_uri.as_deref(), Some("/one-newer"));
}

#[tokio::test]
async fn deletion_is_skipped_when_the_service_was_recached_meanwhile() {
    let h = Harness::new();
    h.cache.cache(service(2, "/two", 1).with_version(3)).unwrap();

    let baseline = h.cache.version_snapshot();
    h.cache.cache(service(2, "/two", 1).with_version(4)).unwrap();
    let applied = h.cache.apply_reconciliation(Vec::new(), &[ServiceId(2)], &baseline);

    assert!(applied.deleted.is_empty());
    assert_eq!(applied.superseded, vec![ServiceId(2)]);
    assert_eq!(h.cache.get(ServiceId(2)).unwrap().version, 4);
}
