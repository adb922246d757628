//! # Observability
//!
//! Structured logging setup. Metrics are emitted through the `metrics` facade
//! by the components themselves; installing an exporter is left to the host.

pub mod logging;

pub use logging::{env_filter, init_tracing};
