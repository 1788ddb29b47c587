//! Conversation compression.
//!
//! When a history grows past the threshold, everything but the most recent
//! messages is summarized by the LLM and replaced with a single anchor
//! message named [`COMPRESS_SUMMARY_NAME`]. The anchor survives later
//! truncation so the model never loses the compressed context entirely.

use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::provider::types::{ChatRequest, Message, Role};
use crate::provider::LlmProvider;
use crate::session::Session;

/// `Message.name` marker for the compression-summary anchor.
pub const COMPRESS_SUMMARY_NAME: &str = "compressSummary";

const SUMMARIZE_SYSTEM_PROMPT: &str = "You are a conversation summarizer. Summarize the \
     conversation below in a concise, information-dense way. Preserve facts, decisions, \
     user preferences, names, and any unfinished business the assistant must remember to \
     continue correctly. The summary will replace the original history.";

/// Compression tuning.
#[derive(Debug, Clone, Copy)]
pub struct CompressorConfig {
    /// Message count above which `compress` actually compresses.
    pub threshold: usize,
    /// How many trailing messages survive verbatim.
    pub keep_recent: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            threshold: 30,
            keep_recent: 10,
        }
    }
}

/// Summarize-old / keep-recent history rewriter.
pub struct Compressor {
    provider: Arc<dyn LlmProvider>,
    config: CompressorConfig,
}

impl Compressor {
    pub fn new(provider: Arc<dyn LlmProvider>, config: CompressorConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> CompressorConfig {
        self.config
    }

    pub fn should_compress(&self, session: &Session) -> bool {
        session.len() > self.config.threshold
    }

    /// Compress when the threshold is exceeded; no-op otherwise.
    pub async fn compress(&self, session: &Session) -> anyhow::Result<()> {
        if !self.should_compress(session) {
            return Ok(());
        }
        self.run(session).await
    }

    /// Compress regardless of the threshold. Used by the context guard and
    /// the overflow-retry path.
    pub async fn force_compress(&self, session: &Session) -> anyhow::Result<()> {
        self.run(session).await
    }

    async fn run(&self, session: &Session) -> anyhow::Result<()> {
        let messages = session.messages();
        if messages.len() <= self.config.keep_recent {
            return Ok(());
        }

        let conversation: String = messages
            .iter()
            .filter(|m| m.role != Role::System && m.role != Role::Tool)
            .map(|m| format!("{}: {}\n", m.role, m.content))
            .collect();

        let req = ChatRequest {
            model: None,
            messages: vec![
                Message::system(SUMMARIZE_SYSTEM_PROMPT),
                Message::user(conversation),
            ],
            tools: Vec::new(),
            max_tokens: 1024,
            temperature: 0.3,
            thinking_budget: None,
        };

        let resp = self
            .provider
            .chat(&req)
            .await
            .context("Compressor.Compress: summarization call failed")?;

        let summary = resp.message.content.trim().to_string();
        if summary.is_empty() {
            debug!("Summarizer returned an empty summary, skipping compression");
            return Ok(());
        }

        let tail_start = messages.len() - self.config.keep_recent;
        let mut rebuilt = Vec::with_capacity(self.config.keep_recent + 1);
        rebuilt.push(Message::assistant(summary).with_name(COMPRESS_SUMMARY_NAME));
        rebuilt.extend(messages[tail_start..].iter().cloned());

        info!(
            before = messages.len(),
            after = rebuilt.len(),
            "Compressed conversation history"
        );
        session.replace_messages(rebuilt);
        Ok(())
    }
}
