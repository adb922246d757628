//! Both caches mutated from several threads while requests resolve.

mod common;

use axum::http::Method;
use common::{invalid_policy, service, valid_policy, Harness};
use gateway_service_cache::{RequestAttributes, ServiceId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ROUNDS: u64 = 500;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cache_and_policy_updates_do_not_deadlock() {
    let h = Harness::new();
    // Newer valid policies make the handler re-read the service from the store
    h.store.put_unnotified(service(1, "/contended", 1));
    h.cache.start();
    h.cache.cache(service(1, "/contended", 1)).unwrap();

    let cache = h.cache.clone();
    let service_writer = tokio::task::spawn_blocking(move || {
        for round in 0..ROUNDS {
            let record = service(1, "/contended", 1 + round % 2).with_version(round + 2);
            let _ = cache.cache(record);
        }
    });

    let runtime = h.policy_runtime.clone();
    let policy_writer = tokio::task::spawn_blocking(move || {
        for round in 0..ROUNDS {
            let policy = if round % 2 == 0 {
                invalid_policy(1, 3 + round)
            } else {
                valid_policy(1, 3 + round)
            };
            let _ = runtime.update(&policy);
        }
    });

    let cache = h.cache.clone();
    let reader = tokio::task::spawn_blocking(move || {
        let request = RequestAttributes::http(Method::GET, "/contended");
        for _ in 0..ROUNDS * 4 {
            if let Some(found) = cache.resolve(&request) {
                assert_eq!(found.id, ServiceId(1));
            }
            let _ = cache.statistics(ServiceId(1));
        }
    });

    let all = async {
        service_writer.await.unwrap();
        policy_writer.await.unwrap();
        reader.await.unwrap();
    };
    tokio::time::timeout(Duration::from_secs(30), all)
        .await
        .expect("writers and readers finished");

    assert_eq!(h.cache.size(), 1);
    h.cache.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_a_half_applied_update() {
    let h = Harness::new();
    h.cache.cache(service(1, "/v1", 1).with_version(1)).unwrap();

    let done = Arc::new(AtomicBool::new(false));

    let cache = h.cache.clone();
    let flag = done.clone();
    let writer = tokio::task::spawn_blocking(move || {
        for version in 2..=ROUNDS {
            let record = service(1, &format!("/v{}", version), 1).with_version(version);
            cache.cache(record).unwrap();
        }
        flag.store(true, Ordering::SeqCst);
    });

    let mut readers = Vec::new();
    for _ in 0..3 {
        let cache = h.cache.clone();
        let flag = done.clone();
        readers.push(tokio::task::spawn_blocking(move || {
            let mut last_seen = 0;
            while !flag.load(Ordering::SeqCst) {
                if let Some(record) = cache.get(ServiceId(1)) {
                    assert_eq!(record.routing_uri.as_deref(), Some(format!("/v{}", record.version).as_str()));
                    assert!(record.version >= last_seen, "version went backwards");
                    last_seen = record.version;
                }
            }
        }));
    }

    let all = async {
        writer.await.unwrap();
        for joined in futures::future::join_all(readers).await {
            joined.unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(30), all)
        .await
        .expect("writer and readers finished");

    let latest = h.cache.get(ServiceId(1)).unwrap();
    assert_eq!(latest.version, ROUNDS);
    let request = RequestAttributes::http(Method::GET, format!("/v{}", ROUNDS));
    assert_eq!(h.cache.resolve(&request).unwrap().id, ServiceId(1));
}
