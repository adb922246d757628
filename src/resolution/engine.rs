//! # Resolution Engine
//!
//! Runs the predicate funnel over a candidate set of services and decides
//! between exactly one match, no match, and a conflict.
//!
//! ## Key Features
//! - Conjunctive predicates: the surviving set does not depend on predicate order
//! - Ambiguity is a conflict, never a silent pick of the first match
//! - Pre-commit validation of a proposed service against the cached ones
//!
//! The engine is stateless apart from its predicate list and borrows the
//! candidates it is handed, so the service cache can call it while holding
//! its read lock.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::types::{RequestAttributes, ServiceId, ServiceRecord};
use crate::resolution::predicates::{default_predicates, ResolutionCriterion, ResolutionPredicate};

/// One colliding pair of services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub service_id: ServiceId,
    pub service_name: String,
    pub competing_service_id: ServiceId,
    pub competing_service_name: String,
    /// The most specific attribute the two services share
    pub criterion: ResolutionCriterion,
    /// The shared value of that attribute, when there is one
    pub value: Option<String>,
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [#{}] collides with {} [#{}] on {}",
            self.service_name, self.service_id, self.competing_service_name, self.competing_service_id, self.criterion
        )?;
        if let Some(value) = &self.value {
            write!(f, " '{}'", value)?;
        }
        Ok(())
    }
}

/// A service whose resolution attributes are ambiguous against others
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionConflict {
    pub service_id: ServiceId,
    pub reports: Vec<ConflictReport>,
}

impl fmt::Display for ResolutionConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resolution conflict for service #{}", self.service_id)?;
        for (i, report) in self.reports.iter().enumerate() {
            f.write_str(if i == 0 { ": " } else { "; " })?;
            write!(f, "{}", report)?;
        }
        Ok(())
    }
}

impl std::error::Error for ResolutionConflict {}

/// Result of resolving one request
#[derive(Debug)]
pub enum ResolutionOutcome<'a> {
    Matched(&'a ServiceRecord),
    NoMatch,
    /// More than one service survived the funnel
    Conflict(Vec<ConflictReport>),
}

pub struct ResolutionEngine {
    predicates: Vec<Box<dyn ResolutionPredicate>>,
}

impl ResolutionEngine {
    /// Engine with the standard predicate set
    pub fn new(catch_all_uri: &str) -> Self {
        Self::with_predicates(default_predicates(catch_all_uri))
    }

    pub fn with_predicates(predicates: Vec<Box<dyn ResolutionPredicate>>) -> Self {
        Self { predicates }
    }

    /// Filter `candidates` by every predicate, keeping those that pass all of them
    pub fn funnel<'a, I>(&self, request: &RequestAttributes, candidates: I) -> Vec<&'a ServiceRecord>
    where
        I: IntoIterator<Item = &'a ServiceRecord>,
    {
        let mut survivors: Vec<&ServiceRecord> = candidates
            .into_iter()
            .filter(|service| {
                self.predicates
                    .iter()
                    .all(|p| !p.applies(service) || p.matches(service, request))
            })
            .collect();
        survivors.sort_by_key(|service| service.id);
        survivors
    }

    pub fn resolve<'a, I>(&self, request: &RequestAttributes, candidates: I) -> ResolutionOutcome<'a>
    where
        I: IntoIterator<Item = &'a ServiceRecord>,
    {
        let survivors = self.funnel(request, candidates);
        match survivors.as_slice() {
            [] => ResolutionOutcome::NoMatch,
            [only] => ResolutionOutcome::Matched(only),
            many => {
                let mut reports = Vec::new();
                for (i, a) in many.iter().enumerate() {
                    for b in &many[i + 1..] {
                        reports.push(self.describe(a, b));
                    }
                }
                ResolutionOutcome::Conflict(reports)
            }
        }
    }

    /// Report how `candidate` collides with `existing`, if some request could reach both
    pub fn conflict_between(&self, candidate: &ServiceRecord, existing: &ServiceRecord) -> Option<ConflictReport> {
        let separable = self
            .predicates
            .iter()
            .filter(|p| p.participates_in_conflicts())
            .any(|p| p.applies(candidate) && p.applies(existing) && !p.overlaps(candidate, existing));

        (!separable).then(|| self.describe(candidate, existing))
    }

    /// Validate a proposed service against the given services, skipping its own id
    pub fn check_resolution<'a, I>(&self, candidate: &ServiceRecord, existing: I) -> Result<(), ResolutionConflict>
    where
        I: IntoIterator<Item = &'a ServiceRecord>,
    {
        let mut reports: Vec<ConflictReport> = existing
            .into_iter()
            .filter(|other| other.id != candidate.id)
            .filter_map(|other| self.conflict_between(candidate, other))
            .collect();

        if reports.is_empty() {
            return Ok(());
        }

        reports.sort_by_key(|r| r.competing_service_id);
        Err(ResolutionConflict {
            service_id: candidate.id,
            reports,
        })
    }

    fn describe(&self, a: &ServiceRecord, b: &ServiceRecord) -> ConflictReport {
        let shared = self
            .predicates
            .iter()
            .filter(|p| p.participates_in_conflicts() && p.applies(a) && p.applies(b))
            .min_by_key(|p| p.criterion());

        let (criterion, value) = match shared {
            Some(p) => (p.criterion(), p.shared_value(a, b)),
            None => (
                ResolutionCriterion::Uri,
                a.routing_uri.clone().or_else(|| b.routing_uri.clone()),
            ),
        };

        ConflictReport {
            service_id: a.id,
            service_name: a.name.clone(),
            competing_service_id: b.id,
            competing_service_name: b.name.clone(),
            criterion,
            value,
        }
    }
}

impl fmt::Debug for ResolutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let criteria: Vec<ResolutionCriterion> = self.predicates.iter().map(|p| p.criterion()).collect();
        f.debug_struct("ResolutionEngine").field("predicates", &criteria).finish()
    }
}
