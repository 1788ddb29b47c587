//! Domain error taxonomy.
//!
//! Errors are built from three pieces: a [`Sentinel`] (the closed set of
//! error kinds), an operation tag (`"Agent.HandleMessage"`), and an optional
//! subsystem label. [`error_code_of`] resolves any error chain to a
//! machine-readable [`ErrorCode`] for API surfaces and telemetry.

pub mod classify;

use std::fmt;

use thiserror::Error;

/// The closed set of error sentinels.
///
/// The first block are *category* sentinels (coarse kinds); the second block
/// are specialized sentinels that map 1:1 to an [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Sentinel {
    // ── Categories ──────────────────────────────────────────────────
    #[error("not found")]
    NotFound,
    #[error("duplicate")]
    Duplicate,
    #[error("timed out")]
    Timeout,
    #[error("limit reached")]
    LimitReached,
    #[error("permission denied")]
    PermissionDenied,
    #[error("disabled")]
    Disabled,
    #[error("invalid input")]
    InvalidInput,
    #[error("provider error")]
    Provider,

    // ── Specialized ─────────────────────────────────────────────────
    #[error("provider not found")]
    ProviderNotFound,
    #[error("tool not found")]
    ToolNotFound,
    #[error("max iterations reached")]
    MaxIterations,
    #[error("session not found")]
    SessionNotFound,
    #[error("path outside sandbox")]
    PathOutsideSandbox,
    #[error("rate limited")]
    RateLimit,
    #[error("invalid credentials")]
    AuthInvalid,
    #[error("context window overflow")]
    ContextOverflow,
    #[error("tool approval denied")]
    ToolApprovalDenied,
    #[error("tool approval timed out")]
    ToolApprovalTimeout,
    #[error("message contains blocked secrets")]
    SecretsBlocked,
    #[error("node unreachable")]
    NodeUnreachable,
    #[error("forbidden")]
    Forbidden,
    #[error("tenant daily limit reached")]
    TenantLimitHit,
    #[error("operation cancelled")]
    Cancelled,
}

/// An error carrying an operation tag, a sentinel, and an optional
/// subsystem label.
///
/// The sentinel survives arbitrary wrapping: [`error_code_of`] walks
/// `source()` chains looking for the innermost `DomainError` or bare
/// [`Sentinel`].
#[derive(Debug)]
pub struct DomainError {
    op: &'static str,
    sentinel: Sentinel,
    subsystem: Option<&'static str>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subsystem {
            Some(sub) => write!(f, "{} [{}]: {}", self.op, sub, self.sentinel),
            None => write!(f, "{}: {}", self.op, self.sentinel),
        }
    }
}

impl std::error::Error for DomainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| &**e as &(dyn std::error::Error + 'static))
    }
}

impl DomainError {
    pub fn new(op: &'static str, sentinel: Sentinel) -> Self {
        Self {
            op,
            sentinel,
            subsystem: None,
            source: None,
        }
    }

    /// Attach an underlying cause.
    pub fn with_source(
        op: &'static str,
        sentinel: Sentinel,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            op,
            sentinel,
            subsystem: None,
            source: Some(source.into()),
        }
    }

    /// Tag the error with a subsystem label (e.g. `"workflow"`).
    pub fn in_subsystem(mut self, subsystem: &'static str) -> Self {
        self.subsystem = Some(subsystem);
        self
    }

    pub fn sentinel(&self) -> Sentinel {
        self.sentinel
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn subsystem(&self) -> Option<&'static str> {
        self.subsystem
    }
}

/// Machine-readable error codes — the closed two-level dispatch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unknown,
    NotFound,
    Duplicate,
    Timeout,
    LimitReached,
    PermissionDenied,
    Disabled,
    InvalidInput,
    ProviderError,
    ProviderNotFound,
    ToolNotFound,
    MaxIterations,
    SessionNotFound,
    PathOutsideSandbox,
    RateLimited,
    AuthInvalid,
    ContextOverflow,
    ToolApprovalDenied,
    ToolApprovalTimeout,
    SecretsBlocked,
    NodeUnreachable,
    Forbidden,
    TenantLimitHit,
    Cancelled,
    // Subsystem-refined codes.
    WorkflowNotFound,
    WorkflowTimeout,
    WorkflowDenied,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::NotFound => "not_found",
            Self::Duplicate => "duplicate",
            Self::Timeout => "timeout",
            Self::LimitReached => "limit_reached",
            Self::PermissionDenied => "permission_denied",
            Self::Disabled => "disabled",
            Self::InvalidInput => "invalid_input",
            Self::ProviderError => "provider_error",
            Self::ProviderNotFound => "provider_not_found",
            Self::ToolNotFound => "tool_not_found",
            Self::MaxIterations => "max_iterations",
            Self::SessionNotFound => "session_not_found",
            Self::PathOutsideSandbox => "path_outside_sandbox",
            Self::RateLimited => "rate_limited",
            Self::AuthInvalid => "auth_invalid",
            Self::ContextOverflow => "context_overflow",
            Self::ToolApprovalDenied => "tool_approval_denied",
            Self::ToolApprovalTimeout => "tool_approval_timeout",
            Self::SecretsBlocked => "secrets_blocked",
            Self::NodeUnreachable => "node_unreachable",
            Self::Forbidden => "forbidden",
            Self::TenantLimitHit => "tenant_limit_hit",
            Self::Cancelled => "cancelled",
            Self::WorkflowNotFound => "workflow_not_found",
            Self::WorkflowTimeout => "workflow_timeout",
            Self::WorkflowDenied => "workflow_denied",
        }
    }
}

/// Direct sentinel → code dispatch (first level).
fn direct_code(sentinel: Sentinel) -> ErrorCode {
    match sentinel {
        Sentinel::NotFound => ErrorCode::NotFound,
        Sentinel::Duplicate => ErrorCode::Duplicate,
        Sentinel::Timeout => ErrorCode::Timeout,
        Sentinel::LimitReached => ErrorCode::LimitReached,
        Sentinel::PermissionDenied => ErrorCode::PermissionDenied,
        Sentinel::Disabled => ErrorCode::Disabled,
        Sentinel::InvalidInput => ErrorCode::InvalidInput,
        Sentinel::Provider => ErrorCode::ProviderError,
        Sentinel::ProviderNotFound => ErrorCode::ProviderNotFound,
        Sentinel::ToolNotFound => ErrorCode::ToolNotFound,
        Sentinel::MaxIterations => ErrorCode::MaxIterations,
        Sentinel::SessionNotFound => ErrorCode::SessionNotFound,
        Sentinel::PathOutsideSandbox => ErrorCode::PathOutsideSandbox,
        Sentinel::RateLimit => ErrorCode::RateLimited,
        Sentinel::AuthInvalid => ErrorCode::AuthInvalid,
        Sentinel::ContextOverflow => ErrorCode::ContextOverflow,
        Sentinel::ToolApprovalDenied => ErrorCode::ToolApprovalDenied,
        Sentinel::ToolApprovalTimeout => ErrorCode::ToolApprovalTimeout,
        Sentinel::SecretsBlocked => ErrorCode::SecretsBlocked,
        Sentinel::NodeUnreachable => ErrorCode::NodeUnreachable,
        Sentinel::Forbidden => ErrorCode::Forbidden,
        Sentinel::TenantLimitHit => ErrorCode::TenantLimitHit,
        Sentinel::Cancelled => ErrorCode::Cancelled,
    }
}

/// `(category sentinel, subsystem)` → refined code dispatch (second level).
fn subsystem_code(sentinel: Sentinel, subsystem: &str) -> Option<ErrorCode> {
    match (sentinel, subsystem) {
        (Sentinel::NotFound, "workflow") => Some(ErrorCode::WorkflowNotFound),
        (Sentinel::Timeout, "workflow") => Some(ErrorCode::WorkflowTimeout),
        (Sentinel::PermissionDenied, "workflow") => Some(ErrorCode::WorkflowDenied),
        _ => None,
    }
}

/// Resolve an error chain to its code.
///
/// Walks `source()` links until a [`DomainError`] or bare [`Sentinel`] is
/// found; falls back to [`ErrorCode::Unknown`].
pub fn error_code_of(err: &(dyn std::error::Error + 'static)) -> ErrorCode {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(de) = e.downcast_ref::<DomainError>() {
            if let Some(sub) = de.subsystem {
                if let Some(code) = subsystem_code(de.sentinel, sub) {
                    return code;
                }
            }
            return direct_code(de.sentinel);
        }
        if let Some(s) = e.downcast_ref::<Sentinel>() {
            return direct_code(*s);
        }
        current = e.source();
    }
    ErrorCode::Unknown
}

/// [`error_code_of`] for `anyhow` chains.
pub fn error_code_of_any(err: &anyhow::Error) -> ErrorCode {
    for cause in err.chain() {
        if let Some(de) = cause.downcast_ref::<DomainError>() {
            if let Some(sub) = de.subsystem {
                if let Some(code) = subsystem_code(de.sentinel, sub) {
                    return code;
                }
            }
            return direct_code(de.sentinel);
        }
        if let Some(s) = cause.downcast_ref::<Sentinel>() {
            return direct_code(*s);
        }
    }
    ErrorCode::Unknown
}
