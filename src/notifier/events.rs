//! Events published on behalf of the service cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::types::ServiceId;

/// Kind of change a cache mutation made to one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Created,
    Updated,
    Deleted,
    Enabled,
    Disabled,
}

impl Transition {
    /// The invalidation operation this transition maps to, if any
    pub fn invalidation_op(self) -> Option<InvalidationOp> {
        match self {
            Self::Created => Some(InvalidationOp::Create),
            Self::Updated => Some(InvalidationOp::Update),
            Self::Deleted => Some(InvalidationOp::Delete),
            Self::Enabled | Self::Disabled => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvalidationOp {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ServiceDisabled,
    ServiceEnabled,
    ResolutionConflict,
}

/// Free-text audit record for disable, enable and conflict occurrences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub service_id: ServiceId,
    pub message: String,
}

impl AuditRecord {
    pub fn new(kind: AuditKind, service_id: ServiceId, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            service_id,
            message: message.into(),
        }
    }
}

/// Counts reported at the end of every reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSummary {
    pub upserted: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Everything the notifier hands to an `EventSink`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    /// Services were created, updated or deleted; `ids` and `ops` are parallel
    Invalidation {
        entity_kind: EntityKind,
        ids: Vec<ServiceId>,
        ops: Vec<InvalidationOp>,
    },
    /// Services became enabled (`enabled == true`) or disabled
    Enablement { ids: Vec<ServiceId>, enabled: bool },
    Audit(AuditRecord),
    ReloadCompleted(ReloadSummary),
}

/// What one cache mutation produced, collected while its write lock was held
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationBatch {
    pub transitions: Vec<(ServiceId, Transition)>,
    pub audits: Vec<AuditRecord>,
}

impl NotificationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, service_id: ServiceId, transition: Transition) {
        self.transitions.push((service_id, transition));
    }

    pub fn audit(&mut self, record: AuditRecord) {
        self.audits.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.audits.is_empty()
    }

    /// Split into publishable events: one invalidation event for
    /// create/update/delete, one enablement event per direction, then audits
    pub fn into_events(self) -> Vec<CacheEvent> {
        let mut ids = Vec::new();
        let mut ops = Vec::new();
        let mut enabled = Vec::new();
        let mut disabled = Vec::new();

        for (id, transition) in self.transitions {
            match transition {
                Transition::Enabled => enabled.push(id),
                Transition::Disabled => disabled.push(id),
                other => {
                    if let Some(op) = other.invalidation_op() {
                        ids.push(id);
                        ops.push(op);
                    }
                }
            }
        }

        let mut events = Vec::new();
        if !ids.is_empty() {
            events.push(CacheEvent::Invalidation {
                entity_kind: EntityKind::Service,
                ids,
                ops,
            });
        }
        if !enabled.is_empty() {
            events.push(CacheEvent::Enablement { ids: enabled, enabled: true });
        }
        if !disabled.is_empty() {
            events.push(CacheEvent::Enablement {
                ids: disabled,
                enabled: false,
            });
        }
        events.extend(self.audits.into_iter().map(CacheEvent::Audit));
        events
    }
}
