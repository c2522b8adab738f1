//! Session lifecycle audit hooks.
//!
//! Callers observe the major transitions of a `SessionRuntime` through a
//! [`SessionAudit`] sink. Records carry a stage plus structured details so
//! they can be logged, buffered or asserted on without touching the runtime.

use std::sync::Mutex;
use std::time::SystemTime;

use serde_json::Value;

/// Distinct lifecycle checkpoints emitted by `SessionRuntime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAuditStage {
    /// An effective configuration was resolved.
    ConfigResolved,
    /// The guest environment was assembled.
    EnvironmentBuilt,
    ProvisionStarted,
    /// Provisioning finished; markers may or may not have been persisted.
    ProvisionCompleted,
    ProvisionFailed,
    /// Every component started and the guest launcher is running.
    SessionStarted,
    SessionStartFailed,
    /// The guest process ended on its own.
    GuestExited,
    /// Teardown finished, with or without stop failures.
    SessionStopped,
}

/// Structured audit entry.
#[derive(Debug, Clone)]
pub struct SessionAuditEvent {
    pub timestamp: SystemTime,
    pub stage: SessionAuditStage,
    pub details: Vec<(String, Value)>,
}

impl SessionAuditEvent {
    fn new(stage: SessionAuditStage) -> Self {
        Self {
            timestamp: SystemTime::now(),
            stage,
            details: Vec::new(),
        }
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Builder helper to append fields ergonomically.
pub struct SessionAuditEventBuilder {
    event: SessionAuditEvent,
}

impl SessionAuditEventBuilder {
    pub fn new(stage: SessionAuditStage) -> Self {
        Self {
            event: SessionAuditEvent::new(stage),
        }
    }

    pub fn detail(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.event.details.push((key.into(), value));
        self
    }

    pub fn finish(self) -> SessionAuditEvent {
        self.event
    }
}

/// Trait implemented by any audit sink.
pub trait SessionAudit: Send + Sync {
    fn record(&self, event: SessionAuditEvent);
}

/// Default no-op implementation used when auditing is disabled.
#[derive(Debug, Default)]
pub struct NullSessionAudit;

impl SessionAudit for NullSessionAudit {
    fn record(&self, _event: SessionAuditEvent) {}
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<SessionAuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionAuditEvent> {
        self.events.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<SessionAuditStage> {
        self.events().iter().map(|event| event.stage).collect()
    }
}

impl SessionAudit for MemoryAudit {
    fn record(&self, event: SessionAuditEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_audit_keeps_order_and_details() {
        let audit = MemoryAudit::new();
        let mut builder = SessionAuditEventBuilder::new(SessionAuditStage::ProvisionCompleted);
        builder.detail("installed", json!(2));
        audit.record(builder.finish());
        audit.record(SessionAuditEventBuilder::new(SessionAuditStage::SessionStarted).finish());

        assert_eq!(
            audit.stages(),
            vec![SessionAuditStage::ProvisionCompleted, SessionAuditStage::SessionStarted]
        );
        assert_eq!(audit.events()[0].detail("installed"), Some(&json!(2)));
    }
}
