//! Workflow data model: pipelines, steps, and runs.
//!
//! A pipeline is a named sequence of typed steps; a run records per-step
//! outputs and an opaque resume token while paused. Errors raised here
//! carry the `workflow` subsystem tag so they resolve to workflow-specific
//! error codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{DomainError, Sentinel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Exec,
    Http,
    Transform,
    Approval,
    ToolCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub steps: Vec<Step>,
    /// Used when a step declares no timeout of its own.
    pub default_timeout_ms: u64,
}

impl Pipeline {
    /// Effective timeout for one step.
    pub fn effective_timeout_ms(&self, step: &Step) -> u64 {
        step.timeout_ms.unwrap_or(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub pipeline: String,
    pub status: RunStatus,
    #[serde(default)]
    pub results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(pipeline: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new().to_string(),
            pipeline: pipeline.to_string(),
            status: RunStatus::Running,
            results: Vec::new(),
            resume_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record(&mut self, result: StepResult) {
        self.results.push(result);
        self.touch();
    }

    /// Park the run behind an approval step.
    pub fn pause(&mut self, resume_token: &str) {
        self.status = RunStatus::Paused;
        self.resume_token = Some(resume_token.to_string());
        self.touch();
    }

    /// Validate a resume token and put the run back in motion.
    pub fn resume(&mut self, token: &str) -> Result<(), DomainError> {
        if self.status != RunStatus::Paused {
            return Err(workflow_error("WorkflowRun.Resume", Sentinel::InvalidInput));
        }
        if self.resume_token.as_deref() != Some(token) {
            return Err(workflow_error(
                "WorkflowRun.Resume",
                Sentinel::PermissionDenied,
            ));
        }
        self.status = RunStatus::Running;
        self.resume_token = None;
        self.touch();
        Ok(())
    }

    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.touch();
    }

    pub fn fail(&mut self) {
        self.status = RunStatus::Failed;
        self.touch();
    }

    pub fn deny(&mut self) {
        self.status = RunStatus::Denied;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = self.updated_at.max(Utc::now());
    }
}

/// A domain error tagged with the `workflow` subsystem.
pub fn workflow_error(op: &'static str, sentinel: Sentinel) -> DomainError {
    DomainError::new(op, sentinel).in_subsystem("workflow")
}
