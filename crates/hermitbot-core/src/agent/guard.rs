//! Proactive token-budget enforcement.
//!
//! The guard runs before the agent loop touches the provider: it counts
//! tokens over the whole session, and when the effective limit is exceeded
//! it compresses opportunistically instead of letting the provider reject
//! the request.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::agent::compress::Compressor;
use crate::error::{DomainError, Sentinel};
use crate::provider::types::Message;
use crate::session::Session;

/// Counts tokens for budget purposes. Injected so a real tokenizer can
/// replace the heuristic.
pub trait TokenCounter: Send + Sync {
    fn count(&self, messages: &[Message]) -> usize;
}

/// `chars / 4 ≈ tokens`, at least 1 per message.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| {
                let chars = m.content.len()
                    + m.thinking.as_deref().map_or(0, str::len)
                    + m.tool_calls
                        .iter()
                        .map(|c| c.arguments.len())
                        .sum::<usize>();
                (chars / 4).max(1)
            })
            .sum()
    }
}

/// Guard tuning.
#[derive(Debug, Clone, Copy)]
pub struct ContextGuardConfig {
    pub max_tokens: usize,
    pub reserve_tokens: usize,
    /// Fraction of the window held back; clamped to `[0, 0.5]`.
    pub safety_margin: f64,
}

impl Default for ContextGuardConfig {
    fn default() -> Self {
        Self {
            max_tokens: 128_000,
            reserve_tokens: 1_000,
            safety_margin: 0.15,
        }
    }
}

impl ContextGuardConfig {
    /// `⌊maxTokens · (1 − safetyMargin)⌋ − reserveTokens`.
    pub fn effective_limit(&self) -> usize {
        let margin = self.safety_margin.clamp(0.0, 0.5);
        let budget = (self.max_tokens as f64 * (1.0 - margin)).floor() as usize;
        budget.saturating_sub(self.reserve_tokens)
    }
}

/// Token-budget guard with opportunistic compression.
pub struct ContextGuard {
    counter: Arc<dyn TokenCounter>,
    compressor: Option<Arc<Compressor>>,
    config: ContextGuardConfig,
}

impl ContextGuard {
    pub fn new(
        counter: Arc<dyn TokenCounter>,
        compressor: Option<Arc<Compressor>>,
        config: ContextGuardConfig,
    ) -> Self {
        Self {
            counter,
            compressor,
            config,
        }
    }

    /// Fail with `ContextOverflow` if the session cannot be brought under
    /// the effective limit.
    pub async fn check(&self, session: &Session) -> Result<(), DomainError> {
        let limit = self.config.effective_limit();
        let used = self.counter.count(&session.messages());
        if used <= limit {
            return Ok(());
        }

        let Some(compressor) = &self.compressor else {
            warn!(used, limit, "Context over budget and no compressor configured");
            return Err(DomainError::new(
                "ContextGuard.Check",
                Sentinel::ContextOverflow,
            ));
        };

        debug!(used, limit, "Context over budget, compressing");
        if let Err(e) = compressor.force_compress(session).await {
            return Err(DomainError::with_source(
                "ContextGuard.Check",
                Sentinel::ContextOverflow,
                e,
            ));
        }

        let used = self.counter.count(&session.messages());
        if used <= limit {
            return Ok(());
        }
        warn!(used, limit, "Still over budget after compression");
        Err(DomainError::new(
            "ContextGuard.Check",
            Sentinel::ContextOverflow,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::compress::CompressorConfig;
    use crate::provider::types::{ChatRequest, ChatResponse, Usage};
    use crate::provider::LlmProvider;
    use async_trait::async_trait;

    struct SummarizerStub;

    #[async_trait]
    impl LlmProvider for SummarizerStub {
        async fn chat(&self, _req: &ChatRequest) -> anyhow::Result<ChatResponse> {
            Ok(ChatResponse {
                message: Message::assistant("summary"),
                usage: Usage::default(),
            })
        }
        fn name(&self) -> &str {
            "stub"
        }
    }

    #[test]
    fn test_effective_limit() {
        let config = ContextGuardConfig::default();
        // 128000 * 0.85 = 108800, minus the reserve.
        assert_eq!(config.effective_limit(), 107_800);

        let config = ContextGuardConfig {
            max_tokens: 1000,
            reserve_tokens: 100,
            safety_margin: 2.0, // clamped to 0.5
        };
        assert_eq!(config.effective_limit(), 400);
    }

    #[test]
    fn test_heuristic_counter() {
        let counter = HeuristicTokenCounter;
        let messages = vec![Message::user("a".repeat(40)), Message::user("")];
        assert_eq!(counter.count(&messages), 10 + 1);
    }

    #[tokio::test]
    async fn test_under_budget_passes() {
        let guard = ContextGuard::new(
            Arc::new(HeuristicTokenCounter),
            None,
            ContextGuardConfig::default(),
        );
        let session = Session::new("cli:x");
        session.append(Message::user("short"));
        assert!(guard.check(&session).await.is_ok());
    }

    #[tokio::test]
    async fn test_over_budget_without_compressor_fails() {
        let guard = ContextGuard::new(
            Arc::new(HeuristicTokenCounter),
            None,
            ContextGuardConfig {
                max_tokens: 40,
                reserve_tokens: 0,
                safety_margin: 0.0,
            },
        );
        let session = Session::new("cli:x");
        for _ in 0..50 {
            session.append(Message::user("a".repeat(40)));
        }
        let err = guard.check(&session).await.unwrap_err();
        assert_eq!(err.sentinel(), Sentinel::ContextOverflow);
    }

    #[tokio::test]
    async fn test_over_budget_compresses_back_under() {
        let compressor = Arc::new(Compressor::new(
            Arc::new(SummarizerStub),
            CompressorConfig {
                threshold: 0,
                keep_recent: 2,
            },
        ));
        let guard = ContextGuard::new(
            Arc::new(HeuristicTokenCounter),
            Some(compressor),
            ContextGuardConfig {
                max_tokens: 60,
                reserve_tokens: 0,
                safety_margin: 0.0,
            },
        );
        let session = Session::new("cli:x");
        for i in 0..30 {
            session.append(Message::user(format!("padding message {i}")));
        }

        guard.check(&session).await.unwrap();
        assert_eq!(session.len(), 3, "summary + keep_recent survived");
    }
}
