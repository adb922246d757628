//! # Service Cache
//!
//! The in-memory service map, its disabled set and catch-all pointer, and the
//! lock it shares with the policy runtime cache.

pub mod coordination;
pub mod service_cache;

pub use coordination::{CrossCacheGuard, SharedCacheLock};
pub use service_cache::{
    AppliedChanges, CacheFailure, CacheOutcome, CacheSettings, DisableReason, ServiceCache, ServiceDecorator,
};
