//! LLM provider trait.
//!
//! Defines the `LlmProvider` contract that all backends must implement.
//! Concrete HTTP clients live outside this crate; the core only consumes
//! the trait. Streaming is an optional extension — providers that cannot
//! stream report `supports_streaming() == false` and callers fall back to
//! the synchronous path.

pub mod retry;
pub mod types;

use async_trait::async_trait;
use tokio::sync::mpsc;

use types::{ChatRequest, ChatResponse, StreamDelta};

/// Trait for LLM providers.
///
/// Any backend that can handle chat completions with tool calling must
/// implement this trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> anyhow::Result<ChatResponse>;

    /// Whether [`LlmProvider::chat_stream`] is implemented.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Send a chat completion request and stream incremental deltas.
    ///
    /// The returned channel closes when the response is complete. The last
    /// delta before close carries `done = true` and the final usage.
    async fn chat_stream(&self, req: &ChatRequest) -> anyhow::Result<mpsc::Receiver<StreamDelta>> {
        let _ = req;
        anyhow::bail!("streaming is not supported by this provider")
    }

    /// Provider identifier for logs and events.
    fn name(&self) -> &str;
}
