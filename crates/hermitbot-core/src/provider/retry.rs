//! Classified retry around LLM calls.
//!
//! With a classifier configured, retryable failures get up to three
//! attempts with exponential backoff and jitter; a context overflow with a
//! compressor configured triggers compression and an immediate retry with
//! the rebuilt request. Without a classifier, every error is final.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::compress::Compressor;
use crate::error::classify::ErrorClassifier;
use crate::error::{DomainError, Sentinel};
use crate::provider::types::{ChatRequest, ChatResponse, StreamDelta};
use crate::provider::LlmProvider;
use crate::session::Session;

/// Backoff tuning.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Attempts per call when a classifier is present.
const MAX_ATTEMPTS: u32 = 3;

enum Step {
    /// Compression happened (or was attempted); retry with no backoff.
    RetryNow,
    /// Back off, then retry.
    RetryAfterBackoff,
}

/// Retry engine shared by the sync and streaming paths.
pub struct LlmRetry {
    classifier: Option<ErrorClassifier>,
    compressor: Option<Arc<Compressor>>,
    policy: RetryPolicy,
}

impl LlmRetry {
    pub fn new(classifier: Option<ErrorClassifier>) -> Self {
        Self {
            classifier,
            compressor: None,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_compressor(mut self, compressor: Option<Arc<Compressor>>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn max_attempts(&self) -> u32 {
        if self.classifier.is_some() {
            MAX_ATTEMPTS
        } else {
            1
        }
    }

    /// Complete-response call with retry. `build` re-reads the session so
    /// a compression between attempts is reflected in the next request.
    pub async fn chat(
        &self,
        provider: &dyn LlmProvider,
        session: &Session,
        build: impl Fn() -> ChatRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ChatResponse> {
        let max = self.max_attempts();
        let mut req = build();
        let mut last_err = None;

        for attempt in 0..max {
            match provider.chat(&req).await {
                Ok(resp) => return Ok(resp),
                Err(err) => match self.on_failure(err, attempt, max, session).await {
                    Ok((Step::RetryNow, err)) => {
                        req = build();
                        last_err = Some(err);
                    }
                    Ok((Step::RetryAfterBackoff, err)) => {
                        last_err = Some(err);
                        if attempt + 1 < max {
                            self.backoff(attempt, cancel).await?;
                        }
                    }
                    Err(fatal) => return Err(fatal),
                },
            }
        }

        Err(last_err.expect("retry loop exits with an error"))
    }

    /// Stream-establishment call with the same retry semantics.
    pub async fn chat_stream(
        &self,
        provider: &dyn LlmProvider,
        session: &Session,
        build: impl Fn() -> ChatRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<StreamDelta>> {
        let max = self.max_attempts();
        let mut req = build();
        let mut last_err = None;

        for attempt in 0..max {
            match provider.chat_stream(&req).await {
                Ok(rx) => return Ok(rx),
                Err(err) => match self.on_failure(err, attempt, max, session).await {
                    Ok((Step::RetryNow, err)) => {
                        req = build();
                        last_err = Some(err);
                    }
                    Ok((Step::RetryAfterBackoff, err)) => {
                        last_err = Some(err);
                        if attempt + 1 < max {
                            self.backoff(attempt, cancel).await?;
                        }
                    }
                    Err(fatal) => return Err(fatal),
                },
            }
        }

        Err(last_err.expect("retry loop exits with an error"))
    }

    /// Decide what one failure means. `Err` is final; `Ok` carries the
    /// retry mode plus the original error (kept as "last error").
    async fn on_failure(
        &self,
        err: anyhow::Error,
        attempt: u32,
        max: u32,
        session: &Session,
    ) -> Result<(Step, anyhow::Error), anyhow::Error> {
        let Some(classifier) = self.classifier else {
            return Err(err);
        };
        let class = classifier.classify(&err);
        if !class.is_retryable() {
            debug!(category = ?class.category, "LLM error is not retryable");
            return Err(err);
        }

        if class.is_overflow() {
            if let Some(compressor) = &self.compressor {
                warn!(attempt, max, "Context overflow, compressing before retry");
                if let Err(ce) = compressor.force_compress(session).await {
                    warn!(error = %ce, "Compression during overflow retry failed");
                }
                return Ok((Step::RetryNow, err));
            }
        }

        warn!(
            attempt,
            max,
            sentinel = ?class.sentinel,
            status = ?class.status_code,
            "Retryable LLM error"
        );
        Ok((Step::RetryAfterBackoff, err))
    }

    /// `baseDelay · 2^attempt + jitter[0, delay/4]`, capped, cancellable.
    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> anyhow::Result<()> {
        let exp = self
            .policy
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let delay = exp.min(self.policy.max_delay);
        let jitter_cap = (delay.as_millis() as u64) / 4;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
        let delay = (delay + jitter).min(self.policy.max_delay + jitter);

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => {
                Err(DomainError::new("LlmRetry.Backoff", Sentinel::Cancelled).into())
            }
        }
    }
}
