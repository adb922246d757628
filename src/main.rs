//! # Gateway Service Cache - Main Entry Point
//!
//! Runs the service cache subsystem as a standalone process backed by the
//! in-memory store, with the admin facade on its own listener.
//!
//! Startup order: configuration → logging → store → caches → initial load →
//! Reconciler → admin server. Shutdown runs in reverse on SIGTERM or Ctrl+C.

use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use gateway_service_cache::admin::{AdminRouter, AdminState};
use gateway_service_cache::notifier::{EventSink, LoggingEventSink};
use gateway_service_cache::observability::init_tracing;
use gateway_service_cache::store::{InMemoryServiceStore, ServiceStore};
use gateway_service_cache::{CacheRuntime, ServiceCacheConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().await?;
    init_tracing(&config.logging)?;

    info!("🚀 Starting gateway service cache");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn ServiceStore> = match &config.seed_file {
        Some(path) => Arc::new(
            InMemoryServiceStore::load_from_file(path)
                .await
                .with_context(|| format!("loading seed file {}", path.display()))?,
        ),
        None => Arc::new(InMemoryServiceStore::new()),
    };

    let sink: Arc<dyn EventSink> = Arc::new(LoggingEventSink);
    let mut runtime = CacheRuntime::build(config.clone(), store, sink)?;
    runtime.start().await?;

    if config.admin.enabled {
        let addr = config.admin_socket_addr()?;
        let router = AdminRouter::create_router(AdminState {
            cache: runtime.cache().clone(),
        });
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding admin listener on {}", addr))?;

        info!("📡 Admin facade listening on {}", addr);
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            error!("Admin server failed: {}", e);
        }
    } else {
        shutdown_signal().await;
    }

    info!("🛑 Shutdown signal received, stopping background tasks...");
    runtime.shutdown().await;
    info!("✅ Gateway service cache shutdown complete");
    Ok(())
}

/// Configuration file from `SERVICE_CACHE_CONFIG`, defaults otherwise
async fn load_config() -> anyhow::Result<ServiceCacheConfig> {
    match std::env::var("SERVICE_CACHE_CONFIG") {
        Ok(path) if path.ends_with(".json") => Ok(ServiceCacheConfig::load_from_json(&path).await?),
        Ok(path) => Ok(ServiceCacheConfig::load_from_file(&path).await?),
        Err(_) => {
            let mut config = ServiceCacheConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
