//! Audit logging seam.
//!
//! The core records *that* something happened, never *what* was said: LLM
//! calls carry no content, tool executions carry no arguments.

use chrono::{DateTime, Utc};
use tracing::info;

/// One auditable action.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Action identifier, e.g. "llm.call", "tool.execute",
    /// "session.create", "tenant.quota".
    pub action: String,
    /// What the action targeted (tool name, session id, tenant id).
    pub subject: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &str, subject: &str, success: bool) -> Self {
        Self {
            action: action.to_string(),
            subject: subject.to_string(),
            success,
            timestamp: Utc::now(),
        }
    }
}

pub trait AuditLogger: Send + Sync {
    fn log(&self, event: AuditEvent);
}

/// Default audit sink: structured `tracing` events on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log(&self, event: AuditEvent) {
        info!(
            target: "audit",
            action = %event.action,
            subject = %event.subject,
            success = event.success,
            "audit"
        );
    }
}
