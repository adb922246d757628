//! Process-level wiring of the service cache subsystem.

pub mod runtime;

pub use runtime::CacheRuntime;
