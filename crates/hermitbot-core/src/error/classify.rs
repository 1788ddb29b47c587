//! Provider-failure classifier.
//!
//! Maps an arbitrary provider error to a retryable/permanent category plus
//! the sentinel that names the failure. Classification order: known
//! sentinels in the chain win first, then HTTP status codes (via
//! [`ProviderApiError`]), then transport-level string patterns.

use crate::error::Sentinel;
use crate::provider::types::ProviderApiError;

/// Coarse retry category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Unknown,
    Retryable,
    Permanent,
}

/// Result of classifying one provider failure.
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub category: ErrorCategory,
    pub sentinel: Option<Sentinel>,
    pub status_code: Option<u16>,
}

impl Classification {
    fn new(category: ErrorCategory, sentinel: Option<Sentinel>, status_code: Option<u16>) -> Self {
        Self {
            category,
            sentinel,
            status_code,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category == ErrorCategory::Retryable
    }

    pub fn is_overflow(&self) -> bool {
        self.sentinel == Some(Sentinel::ContextOverflow)
    }
}

/// Body substrings that turn an HTTP 400 into a context overflow.
const OVERFLOW_400_MARKERS: &[&str] = &["context", "token", "length", "too long", "maximum"];

/// Message substrings that signal an overflow regardless of status.
const OVERFLOW_MARKERS: &[&str] = &["context length", "token limit", "maximum context"];

/// Message substrings that signal a rate limit regardless of status.
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "too many requests"];

/// Transport-level failures worth retrying.
const NETWORK_MARKERS: &[&str] = &[
    "connection refused",
    "no such host",
    "timeout",
    "deadline exceeded",
    "connection reset",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an `anyhow` error chain.
    pub fn classify(&self, err: &anyhow::Error) -> Classification {
        // 1. A known sentinel anywhere in the chain wins.
        for cause in err.chain() {
            let sentinel = if let Some(de) = cause.downcast_ref::<crate::error::DomainError>() {
                Some(de.sentinel())
            } else {
                cause.downcast_ref::<Sentinel>().copied()
            };
            if let Some(s) = sentinel {
                return Self::from_sentinel(s);
            }
        }

        // 2. HTTP status (and body) from a provider API error.
        for cause in err.chain() {
            if let Some(api) = cause.downcast_ref::<ProviderApiError>() {
                if let Some(c) = Self::from_status(api.status, &api.message) {
                    return c;
                }
            }
        }

        // 3. String patterns over the rendered chain.
        let text = format!("{err:#}").to_lowercase();
        if contains_any(&text, RATE_LIMIT_MARKERS) {
            return Classification::new(
                ErrorCategory::Retryable,
                Some(Sentinel::RateLimit),
                None,
            );
        }
        if contains_any(&text, OVERFLOW_MARKERS) {
            return Classification::new(
                ErrorCategory::Retryable,
                Some(Sentinel::ContextOverflow),
                None,
            );
        }
        if contains_any(&text, NETWORK_MARKERS) {
            return Classification::new(ErrorCategory::Retryable, None, None);
        }

        Classification::new(ErrorCategory::Unknown, None, None)
    }

    fn from_sentinel(sentinel: Sentinel) -> Classification {
        let category = match sentinel {
            Sentinel::RateLimit
            | Sentinel::ContextOverflow
            | Sentinel::Timeout
            | Sentinel::NodeUnreachable => ErrorCategory::Retryable,
            _ => ErrorCategory::Permanent,
        };
        Classification::new(category, Some(sentinel), None)
    }

    fn from_status(status: u16, body: &str) -> Option<Classification> {
        let lower = body.to_lowercase();
        match status {
            429 => Some(Classification::new(
                ErrorCategory::Retryable,
                Some(Sentinel::RateLimit),
                Some(status),
            )),
            401 | 403 => Some(Classification::new(
                ErrorCategory::Permanent,
                Some(Sentinel::AuthInvalid),
                Some(status),
            )),
            413 => Some(Classification::new(
                ErrorCategory::Retryable,
                Some(Sentinel::ContextOverflow),
                Some(status),
            )),
            400 => {
                if contains_any(&lower, OVERFLOW_400_MARKERS) {
                    Some(Classification::new(
                        ErrorCategory::Retryable,
                        Some(Sentinel::ContextOverflow),
                        Some(status),
                    ))
                } else {
                    Some(Classification::new(ErrorCategory::Permanent, None, Some(status)))
                }
            }
            500..=599 => Some(Classification::new(
                ErrorCategory::Retryable,
                None,
                Some(status),
            )),
            _ => None,
        }
    }
}

fn contains_any(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| text.contains(m))
}
