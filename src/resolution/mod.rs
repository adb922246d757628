//! # Service Resolution
//!
//! Maps the resolution attributes of a request onto a single published
//! service, and detects configurations that would make that mapping ambiguous.

pub mod engine;
pub mod predicates;

pub use engine::{ConflictReport, ResolutionConflict, ResolutionEngine, ResolutionOutcome};
pub use predicates::{
    default_predicates, MethodPredicate, NamespacePredicate, ResolutionCriterion, ResolutionPredicate,
    ServiceIdPredicate, SoapActionPredicate, SoapModePredicate, UriPredicate,
};
