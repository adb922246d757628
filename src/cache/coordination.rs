//! # Cross-Cache Coordination
//!
//! The service cache and the policy runtime cache both mutate state owned by the
//! other one: caching a service compiles its policy, and a policy turning
//! invalid disables its service. If each cache took its own lock first and then
//! waited on the other's, two threads refreshing the caches concurrently would
//! deadlock.
//!
//! Both caches therefore share one `SharedCacheLock`. Any operation that crosses
//! the boundary takes it before touching either cache's private state, so the
//! acquisition order is always:
//!
//! 1. `SharedCacheLock` (write)
//! 2. service cache state
//! 3. policy runtime entries
//!
//! The handle is created once by the composition root and cloned into both
//! caches. Neither cache creates its own.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::Arc;

/// Reader/writer lock jointly owned by the service cache and the policy runtime cache
#[derive(Clone, Default)]
pub struct SharedCacheLock {
    inner: Arc<RwLock<()>>,
}

impl SharedCacheLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for an operation that mutates state on both sides
    pub fn write(&self) -> CrossCacheGuard<'_> {
        CrossCacheGuard {
            owner: self,
            _guard: self.inner.write(),
        }
    }

    /// Acquire the lock for an operation that only reads across the boundary
    pub fn read(&self) -> CrossCacheReadGuard<'_> {
        CrossCacheReadGuard {
            _guard: self.inner.read(),
        }
    }

    /// Whether two handles refer to the same underlying lock
    pub fn same_as(&self, other: &SharedCacheLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SharedCacheLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCacheLock")
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}

/// Proof that the shared lock is held for writing
///
/// Methods that touch the other cache's state take `&CrossCacheGuard` instead
/// of locking again, which keeps the non-reentrant lock from being re-acquired
/// on the same thread.
pub struct CrossCacheGuard<'a> {
    owner: &'a SharedCacheLock,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl CrossCacheGuard<'_> {
    /// Whether this guard was taken on `lock`
    pub fn guards(&self, lock: &SharedCacheLock) -> bool {
        self.owner.same_as(lock)
    }
}

pub struct CrossCacheReadGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}
