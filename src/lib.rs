//! # Gateway Service Cache - Core Library Crate
//!
//! The service cache and resolution engine of an API gateway node. It keeps an
//! in-memory view of every published service, resolves inbound requests to
//! exactly one of them, and stays consistent with the durable store through
//! commit hooks and a periodic integrity check.
//!
//! ## Module Overview
//!
//! - `cache`: the service map, disabled set and catch-all pointer, plus the lock
//!   shared with the policy runtime cache
//! - `policy`: the sibling cache of compiled policies and its validity events
//! - `resolution`: predicate funnel and conflict detection
//! - `reconciler`: the periodic version-map integrity check
//! - `notifier`: single-worker publication of cache events
//! - `store`: the durable store contract and an in-memory implementation
//! - `admin`: HTTP facade for administrators
//! - `gateway`: composition root wiring everything together
//!
//! ## Concurrency Model
//!
//! Request resolution runs on many threads and only ever waits on an in-memory
//! read lock. Mutations take a write lock, never perform I/O while holding it,
//! and announce themselves through the notifier after releasing it.

/// Error types, configuration and the shared data model
pub mod core;

/// Service cache and cross-cache coordination
pub mod cache;

/// Policy runtime cache and compiler seam
pub mod policy;

/// Request-to-service resolution
pub mod resolution;

/// Periodic integrity check against the store
pub mod reconciler;

/// Ordered, out-of-lock event publication
pub mod notifier;

/// Durable store contract and the in-memory store
pub mod store;

/// Administrative HTTP endpoints
pub mod admin;

/// Tracing subscriber setup
pub mod observability;

/// Composition root
pub mod gateway;

pub use core::config::ServiceCacheConfig;
pub use core::error::{ServiceCacheError, ServiceCacheResult};
pub use core::types::{PolicyId, PolicyRecord, RequestAttributes, ServiceId, ServiceRecord};

pub use cache::{ServiceCache, SharedCacheLock};
pub use gateway::CacheRuntime;
pub use policy::{PolicyEvent, PolicyRuntimeCache};
pub use resolution::{ConflictReport, ResolutionConflict, ResolutionEngine};
