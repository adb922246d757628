//! # Policy Runtime
//!
//! The sibling cache of compiled policies. It shares its coordination lock
//! with the service cache and reports validity changes as `PolicyEvent`s.

pub mod compiler;
pub mod runtime;

pub use compiler::{unique_version, BasicPolicyCompiler, CompiledPolicy, PolicyCompiler};
pub use runtime::{PolicyEvent, PolicyHandle, PolicyRuntimeCache};
