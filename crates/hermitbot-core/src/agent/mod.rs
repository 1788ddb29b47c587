//! Agent loop: the core processing engine.
//!
//! The loop:
//! 1. Acquires the per-session lock (when configured)
//! 2. Appends the user message and runs the context guard
//! 3. Recalls memory context for the user text
//! 4. Calls the LLM (with classified retry)
//! 5. If the LLM returns tool calls → executes them all in parallel →
//!    feeds results back in call order → repeats
//! 6. When the LLM returns a final text response → returns it
//!
//! Streaming mode runs the same loop but accumulates per-chunk deltas and
//! publishes `stream.*` events as they arrive.

pub mod accumulator;
pub mod compress;
pub mod context;
pub mod guard;
pub mod repair;
pub mod subagent;

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLogger};
use crate::bus::events::{topics, Event};
use crate::bus::EventBus;
use crate::error::classify::ErrorClassifier;
use crate::error::{DomainError, Sentinel};
use crate::memory::{MemoryEntry, MemoryProvider};
use crate::provider::retry::LlmRetry;
use crate::provider::types::{Message, ToolCall, Usage};
use crate::provider::LlmProvider;
use crate::session::locker::SessionLocker;
use crate::session::Session;
use crate::tools::{ToolApprover, ToolExecutor};
use accumulator::StreamAccumulator;
use compress::Compressor;
use context::ContextBuilder;
use guard::ContextGuard;

/// Configuration for the agent loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identifier used in routing and events.
    pub id: String,
    /// Maximum LLM+tool iterations per message.
    pub max_iterations: u32,
    /// How many memory entries to recall per message.
    pub memory_top_k: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: "main".to_string(),
            max_iterations: 10,
            memory_top_k: 5,
        }
    }
}

/// The core agent loop.
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolExecutor>,
    context: ContextBuilder,
    config: AgentConfig,
    locker: Option<SessionLocker>,
    guard: Option<ContextGuard>,
    compressor: Option<Arc<Compressor>>,
    memory: Option<Arc<dyn MemoryProvider>>,
    approver: Option<Arc<dyn ToolApprover>>,
    bus: Option<Arc<EventBus>>,
    audit: Option<Arc<dyn AuditLogger>>,
    classifier: Option<ErrorClassifier>,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolExecutor>,
        context: ContextBuilder,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            context,
            config,
            locker: None,
            guard: None,
            compressor: None,
            memory: None,
            approver: None,
            bus: None,
            audit: None,
            classifier: None,
        }
    }

    pub fn with_locker(mut self, locker: SessionLocker) -> Self {
        self.locker = Some(locker);
        self
    }

    pub fn with_guard(mut self, guard: ContextGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn ToolApprover>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Process one user message synchronously and return the final text.
    pub async fn handle_message(
        &self,
        session: &Arc<Session>,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        self.run(session, user_text, false, cancel).await
    }

    /// Process one user message, emitting incremental delta events when
    /// the provider supports streaming. Falls back to the synchronous path
    /// (with a single completed event) otherwise.
    pub async fn handle_message_stream(
        &self,
        session: &Arc<Session>,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        self.run(session, user_text, true, cancel).await
    }

    async fn run(
        &self,
        session: &Arc<Session>,
        user_text: &str,
        streaming: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let _lock = match &self.locker {
            Some(locker) => Some(
                locker
                    .lock(session.id(), cancel)
                    .await
                    .map_err(|e| anyhow::Error::new(e).context("Agent.HandleMessage: session lock"))?,
            ),
            None => None,
        };

        info!(
            agent = %self.config.id,
            session = session.id(),
            streaming,
            "Processing user message"
        );

        session.append(Message::user(user_text));

        if let Some(guard) = &self.guard {
            guard.check(session).await?;
        }

        let memories = self.recall(user_text).await;

        if streaming {
            self.publish(session, topics::STREAM_STARTED, json!(null));
        }

        let schemas = self.tools.schemas();
        let retry = LlmRetry::new(self.classifier).with_compressor(self.compressor.clone());
        let mut total_usage = Usage::default();

        for iteration in 0..self.config.max_iterations {
            let build = || {
                let history = session.messages();
                self.context.build(&history, &memories, schemas.clone())
            };

            debug!(iteration, msg_count = session.len(), "Calling LLM");
            self.publish(
                session,
                topics::LLM_CALL_STARTED,
                json!({"iteration": iteration, "provider": self.provider.name()}),
            );

            let result = if streaming && self.provider.supports_streaming() {
                self.stream_once(&retry, session, &build, cancel).await
            } else {
                retry
                    .chat(self.provider.as_ref(), session, &build, cancel)
                    .await
                    .map(|resp| (resp.message, resp.usage))
            };

            self.audit("llm.call", session.id(), result.is_ok());

            let (assistant, usage) = match result {
                Ok(out) => out,
                Err(e) => {
                    if streaming {
                        self.publish(
                            session,
                            topics::STREAM_ERROR,
                            json!({"error": format!("{e:#}")}),
                        );
                    }
                    return Err(e.context("Agent.HandleMessage: llm call"));
                }
            };

            self.publish(
                session,
                topics::LLM_CALL_COMPLETED,
                json!({
                    "iteration": iteration,
                    "tool_calls": assistant.tool_calls.len(),
                    "usage": usage,
                }),
            );
            total_usage.add(usage);

            session.append(assistant.clone());

            if assistant.tool_calls.is_empty() {
                if let Some(compressor) = &self.compressor {
                    if compressor.should_compress(session) {
                        if let Err(e) = compressor.compress(session).await {
                            warn!(error = %e, "Post-response compression failed");
                        }
                    }
                }
                if streaming {
                    self.publish(
                        session,
                        topics::STREAM_COMPLETED,
                        json!({"content": &assistant.content, "usage": total_usage}),
                    );
                }
                info!(
                    tokens = total_usage.total_tokens,
                    iterations = iteration + 1,
                    "Response complete"
                );
                return Ok(assistant.content);
            }

            let results = self.dispatch_tool_calls(session, &assistant.tool_calls).await;
            session.append_all(results);

            if let Some(guard) = &self.guard {
                guard.check(session).await?;
            }
        }

        warn!(
            iterations = self.config.max_iterations,
            "Hit max tool iterations"
        );
        let err = DomainError::new("Agent.HandleMessage", Sentinel::MaxIterations);
        if streaming {
            self.publish(session, topics::STREAM_ERROR, json!({"error": err.to_string()}));
        }
        Err(err.into())
    }

    /// Run one streaming LLM call to completion, publishing deltas.
    async fn stream_once(
        &self,
        retry: &LlmRetry,
        session: &Arc<Session>,
        build: &(impl Fn() -> crate::provider::types::ChatRequest + Sync),
        cancel: &CancellationToken,
    ) -> anyhow::Result<(Message, Usage)> {
        let mut rx = retry
            .chat_stream(self.provider.as_ref(), session, build, cancel)
            .await?;

        let mut acc = StreamAccumulator::new();
        loop {
            tokio::select! {
                delta = rx.recv() => match delta {
                    Some(delta) => {
                        if let Some(content) = &delta.content {
                            self.publish(
                                session,
                                topics::STREAM_DELTA,
                                json!({"content": content}),
                            );
                        }
                        acc.push(&delta);
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    return Err(DomainError::new(
                        "Agent.HandleMessageStream",
                        Sentinel::Cancelled,
                    )
                    .into());
                }
            }
        }

        let usage = acc.usage();
        Ok((acc.into_message(), usage))
    }

    /// Run all tool calls of one assistant message concurrently.
    ///
    /// Results come back in the original call order no matter which call
    /// finishes first.
    async fn dispatch_tool_calls(
        &self,
        session: &Arc<Session>,
        calls: &[ToolCall],
    ) -> Vec<Message> {
        let mut join = JoinSet::new();
        for (idx, call) in calls.iter().cloned().enumerate() {
            let tools = Arc::clone(&self.tools);
            let approver = self.approver.clone();
            let bus = self.bus.clone();
            let audit = self.audit.clone();
            let session_id = session.id().to_string();
            join.spawn(async move {
                (
                    idx,
                    execute_tool_call(tools, approver, bus, audit, session_id, call).await,
                )
            });
        }

        let mut results: Vec<Option<Message>> = (0..calls.len()).map(|_| None).collect();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((idx, msg)) => results[idx] = Some(msg),
                Err(e) => warn!(error = %e, "Tool task failed to join"),
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    Message::tool_result(
                        &calls[idx].id,
                        &calls[idx].name,
                        "[error] tool execution aborted",
                    )
                })
            })
            .collect()
    }

    async fn recall(&self, text: &str) -> Vec<MemoryEntry> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        if !memory.is_available() {
            return Vec::new();
        }
        match memory.query(text, self.config.memory_top_k).await {
            Ok(entries) => {
                debug!(count = entries.len(), backend = memory.name(), "Recalled memories");
                entries
            }
            Err(e) => {
                warn!(error = %e, "Memory query failed, continuing without context");
                Vec::new()
            }
        }
    }

    fn publish(&self, session: &Session, topic: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(Event::new(topic, session.id()).with_payload(payload));
        }
    }

    fn audit(&self, action: &str, subject: &str, success: bool) {
        if let Some(audit) = &self.audit {
            audit.log(AuditEvent::new(action, subject, success));
        }
    }
}

/// Execute one tool call end to end: resolution, approval, execution.
///
/// Never fails — every failure mode becomes a synthetic `tool` message
/// carrying the original call id, so the LLM can react and the loop
/// continues.
async fn execute_tool_call(
    tools: Arc<dyn ToolExecutor>,
    approver: Option<Arc<dyn ToolApprover>>,
    bus: Option<Arc<EventBus>>,
    audit: Option<Arc<dyn AuditLogger>>,
    session_id: String,
    call: ToolCall,
) -> Message {
    let publish = |topic: &str, payload: serde_json::Value| {
        if let Some(bus) = &bus {
            bus.publish(Event::new(topic, &session_id).with_payload(payload));
        }
    };

    let Some(tool) = tools.get(&call.name) else {
        warn!(tool = %call.name, "Tool not found");
        return Message::tool_result(
            &call.id,
            &call.name,
            format!("tool '{}' not found", call.name),
        );
    };

    if let Some(approver) = &approver {
        if approver.needs_approval(&call) {
            publish(
                topics::TOOL_APPROVAL_REQUEST,
                json!({"tool": &call.name, "id": &call.id}),
            );
            let decision = approver.request_approval(&call).await;
            publish(
                topics::TOOL_APPROVAL_RESPONSE,
                json!({
                    "tool": call.name,
                    "id": call.id,
                    "approved": matches!(decision, Ok(true)),
                }),
            );
            match decision {
                Ok(true) => {}
                Ok(false) => {
                    return Message::tool_result(
                        &call.id,
                        &call.name,
                        format!("tool '{}' denied by approver", call.name),
                    );
                }
                Err(e) => {
                    return Message::tool_result(
                        &call.id,
                        &call.name,
                        format!("tool approval failed: {e:#}"),
                    );
                }
            }
        }
    }

    publish(
        topics::TOOL_CALL_STARTED,
        json!({"tool": &call.name, "id": &call.id}),
    );
    let args: serde_json::Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
    let result = tool.execute(args).await;
    let success = result.is_ok();
    publish(
        topics::TOOL_CALL_COMPLETED,
        json!({"tool": &call.name, "id": &call.id, "success": success}),
    );
    if let Some(audit) = &audit {
        audit.log(AuditEvent::new("tool.execute", &call.name, success));
    }

    match result {
        Ok(output) => Message::tool_result(&call.id, &call.name, output.content),
        Err(e) => Message::tool_result(&call.id, &call.name, format!("{e:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::{
        ChatRequest, ChatResponse, ProviderApiError, Role, StreamDelta, ToolCallDelta,
    };
    use crate::tools::{Tool, ToolRegistry, ToolResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    enum Scripted {
        Text(&'static str),
        Calls(Vec<ToolCall>),
        Fail(ProviderApiError),
    }

    struct MockProvider {
        script: Mutex<Vec<Scripted>>,
        calls: AtomicUsize,
        streaming: bool,
    }

    impl MockProvider {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                streaming: false,
            })
        }

        fn next(&self) -> Scripted {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Scripted::Text("out of script")
            } else {
                script.remove(0)
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn chat(&self, _req: &ChatRequest) -> anyhow::Result<ChatResponse> {
            match self.next() {
                Scripted::Text(text) => Ok(ChatResponse {
                    message: Message::assistant(text),
                    usage: Usage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15,
                    },
                }),
                Scripted::Calls(calls) => Ok(ChatResponse {
                    message: Message::assistant_with_tool_calls("", calls),
                    usage: Usage::default(),
                }),
                Scripted::Fail(api) => Err(api.into()),
            }
        }

        fn supports_streaming(&self) -> bool {
            self.streaming
        }

        async fn chat_stream(
            &self,
            _req: &ChatRequest,
        ) -> anyhow::Result<mpsc::Receiver<StreamDelta>> {
            let step = self.next();
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                match step {
                    Scripted::Text(text) => {
                        // Fragment the text into two content deltas.
                        let mid = text.len() / 2;
                        let _ = tx
                            .send(StreamDelta {
                                content: Some(text[..mid].to_string()),
                                ..StreamDelta::default()
                            })
                            .await;
                        let _ = tx
                            .send(StreamDelta {
                                content: Some(text[mid..].to_string()),
                                ..StreamDelta::default()
                            })
                            .await;
                        let _ = tx
                            .send(StreamDelta {
                                done: true,
                                usage: Some(Usage {
                                    total_tokens: 15,
                                    ..Usage::default()
                                }),
                                ..StreamDelta::default()
                            })
                            .await;
                    }
                    Scripted::Calls(calls) => {
                        let _ = tx
                            .send(StreamDelta {
                                tool_calls: Some(
                                    calls
                                        .iter()
                                        .map(|c| ToolCallDelta {
                                            id: c.id.clone(),
                                            name: c.name.clone(),
                                            arguments: c.arguments.clone(),
                                        })
                                        .collect(),
                                ),
                                ..StreamDelta::default()
                            })
                            .await;
                        let _ = tx
                            .send(StreamDelta {
                                done: true,
                                ..StreamDelta::default()
                            })
                            .await;
                    }
                    Scripted::Fail(_) => {}
                }
            });
            Ok(rx)
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    /// Tool that sleeps, then answers — used to prove ordering is by call
    /// position, not completion time.
    struct SlowTool {
        tool_name: &'static str,
        answer: &'static str,
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            self.tool_name
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Value) -> anyhow::Result<ToolResult> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(self.answer.into())
        }
    }

    fn registry(tools: Vec<SlowTool>) -> Arc<dyn ToolExecutor> {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(Arc::new(tool));
        }
        Arc::new(registry)
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: "{}".into(),
        }
    }

    fn agent(provider: Arc<MockProvider>, tools: Arc<dyn ToolExecutor>) -> Agent {
        Agent::new(
            provider,
            tools,
            ContextBuilder::new(context::ContextConfig::default()),
            AgentConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_parallel_tools_append_in_call_order() {
        let provider = MockProvider::new(vec![
            Scripted::Calls(vec![call("w", "weather"), call("t", "time"), call("n", "news")]),
            Scripted::Text("briefing ok"),
        ]);
        let tools = registry(vec![
            SlowTool {
                tool_name: "weather",
                answer: "sunny",
                delay_ms: 60,
            },
            SlowTool {
                tool_name: "time",
                answer: "14:30",
                delay_ms: 30,
            },
            SlowTool {
                tool_name: "news",
                answer: "quiet",
                delay_ms: 1,
            },
        ]);

        let agent = agent(provider, tools);
        let session = Arc::new(Session::new("cli:t"));
        let cancel = CancellationToken::new();

        let reply = agent.handle_message(&session, "brief me", &cancel).await.unwrap();
        assert_eq!(reply, "briefing ok");

        let messages = session.messages();
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].tool_calls.len(), 3);
        assert_eq!(messages[2].tool_call_id(), Some("w"));
        assert_eq!(messages[2].content, "sunny");
        assert_eq!(messages[3].tool_call_id(), Some("t"));
        assert_eq!(messages[3].content, "14:30");
        assert_eq!(messages[4].tool_call_id(), Some("n"));
        assert_eq!(messages[4].content, "quiet");
        assert_eq!(messages[5].role, Role::Assistant);
        assert!(messages[5].tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_tool_not_found_recovers() {
        let provider = MockProvider::new(vec![
            Scripted::Calls(vec![call("1", "nope")]),
            Scripted::Text("sorry"),
        ]);
        let agent = agent(provider, Arc::new(ToolRegistry::new()));
        let session = Arc::new(Session::new("cli:t"));
        let cancel = CancellationToken::new();

        let reply = agent.handle_message(&session, "use it", &cancel).await.unwrap();
        assert_eq!(reply, "sorry");

        let messages = session.messages();
        let tool_msg = messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .expect("synthetic tool message present");
        assert_eq!(tool_msg.tool_call_id(), Some("1"));
        assert!(tool_msg.content.contains("not found"));
    }

    #[tokio::test]
    async fn test_max_iterations() {
        let provider = MockProvider::new(vec![
            Scripted::Calls(vec![call("1", "echo")]),
            Scripted::Calls(vec![call("2", "echo")]),
            Scripted::Calls(vec![call("3", "echo")]),
        ]);
        let tools = registry(vec![SlowTool {
            tool_name: "echo",
            answer: "ok",
            delay_ms: 0,
        }]);

        let mut agent = agent(provider, tools);
        agent.config.max_iterations = 3;
        let session = Arc::new(Session::new("cli:t"));
        let cancel = CancellationToken::new();

        let err = agent
            .handle_message(&session, "loop forever", &cancel)
            .await
            .unwrap_err();
        assert_eq!(
            crate::error::error_code_of_any(&err),
            crate::error::ErrorCode::MaxIterations
        );
        // 1 user + 3 × (assistant + tool).
        assert_eq!(session.len(), 7);
    }

    #[tokio::test]
    async fn test_tool_error_becomes_tool_message() {
        struct FailingTool;
        #[async_trait]
        impl Tool for FailingTool {
            fn name(&self) -> &str {
                "boom"
            }
            fn description(&self) -> &str {
                "fails"
            }
            fn parameters(&self) -> serde_json::Value {
                json!({"type": "object"})
            }
            async fn execute(&self, _args: serde_json::Value) -> anyhow::Result<ToolResult> {
                anyhow::bail!("exploded")
            }
        }

        let provider = MockProvider::new(vec![
            Scripted::Calls(vec![call("1", "boom")]),
            Scripted::Text("handled"),
        ]);
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool));
        let agent = agent(provider, Arc::new(registry));
        let session = Arc::new(Session::new("cli:t"));
        let cancel = CancellationToken::new();

        let reply = agent.handle_message(&session, "go", &cancel).await.unwrap();
        assert_eq!(reply, "handled");
        let tool_msg = session
            .messages()
            .into_iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.contains("exploded"));
    }

    #[tokio::test]
    async fn test_approval_denial_skips_execution() {
        struct DenyAll;
        #[async_trait]
        impl ToolApprover for DenyAll {
            fn needs_approval(&self, _call: &ToolCall) -> bool {
                true
            }
            async fn request_approval(&self, _call: &ToolCall) -> anyhow::Result<bool> {
                Ok(false)
            }
        }

        let provider = MockProvider::new(vec![
            Scripted::Calls(vec![call("1", "echo")]),
            Scripted::Text("done"),
        ]);
        let tools = registry(vec![SlowTool {
            tool_name: "echo",
            answer: "should not run",
            delay_ms: 0,
        }]);

        let agent = agent(provider, tools).with_approver(Arc::new(DenyAll));
        let session = Arc::new(Session::new("cli:t"));
        let cancel = CancellationToken::new();

        let reply = agent.handle_message(&session, "go", &cancel).await.unwrap();
        assert_eq!(reply, "done");
        let tool_msg = session
            .messages()
            .into_iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.contains("denied"));
    }

    #[tokio::test]
    async fn test_overflow_retry_compresses_and_recovers() {
        // Script: overflow (agent), summary (compressor), recovered (agent).
        let provider = MockProvider::new(vec![
            Scripted::Fail(ProviderApiError {
                status: 400,
                message: "maximum context length exceeded".into(),
            }),
            Scripted::Text("summary"),
            Scripted::Text("recovered"),
        ]);
        let compressor = Arc::new(Compressor::new(
            provider.clone() as Arc<dyn LlmProvider>,
            compress::CompressorConfig {
                threshold: 100,
                keep_recent: 3,
            },
        ));

        let agent = agent(provider.clone(), Arc::new(ToolRegistry::new()))
            .with_classifier(ErrorClassifier::new())
            .with_compressor(compressor);

        let session = Arc::new(Session::new("cli:t"));
        for i in 0..20 {
            session.append(Message::user(format!("m{i}")));
        }
        let cancel = CancellationToken::new();

        let reply = agent.handle_message(&session, "continue", &cancel).await.unwrap();
        assert_eq!(reply, "recovered");
        // Two agent-facing LLM calls plus one summarization call.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        // 1 summary + 3 kept + appended assistant reply; the new user
        // message landed inside the compressed window.
        let count = session.len();
        assert!((4..=6).contains(&count), "unexpected count {count}");
    }

    #[tokio::test]
    async fn test_streaming_emits_events_and_accumulates() {
        let mut inner = MockProvider::new(vec![
            Scripted::Calls(vec![call("c1", "echo")]),
            Scripted::Text("Hello"),
        ]);
        Arc::get_mut(&mut inner).unwrap().streaming = true;

        let tools = registry(vec![SlowTool {
            tool_name: "echo",
            answer: "ok",
            delay_ms: 0,
        }]);

        let bus = Arc::new(EventBus::new());
        let started = Arc::new(AtomicUsize::new(0));
        let deltas = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        for (topic, counter) in [
            (topics::STREAM_STARTED, Arc::clone(&started)),
            (topics::STREAM_DELTA, Arc::clone(&deltas)),
            (topics::STREAM_COMPLETED, Arc::clone(&completed)),
        ] {
            let _unsub = bus.subscribe(topic, move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        let agent = agent(inner, tools).with_bus(Arc::clone(&bus));
        let session = Arc::new(Session::new("cli:t"));
        let cancel = CancellationToken::new();

        let reply = agent
            .handle_message_stream(&session, "stream it", &cancel)
            .await
            .unwrap();
        assert_eq!(reply, "Hello");
        bus.close().await;

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(deltas.load(Ordering::SeqCst), 2, "two content fragments");
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        let messages = session.messages();
        assert_eq!(messages.last().unwrap().content, "Hello");
        assert_eq!(messages[1].tool_calls[0].id, "c1");
    }

    #[tokio::test]
    async fn test_memory_failure_is_nonfatal() {
        struct BrokenMemory;
        #[async_trait]
        impl MemoryProvider for BrokenMemory {
            async fn store(&self, _entry: MemoryEntry) -> anyhow::Result<()> {
                Ok(())
            }
            async fn query(&self, _text: &str, _limit: usize) -> anyhow::Result<Vec<MemoryEntry>> {
                anyhow::bail!("backend offline")
            }
            async fn delete(&self, _id: &str) -> anyhow::Result<()> {
                Ok(())
            }
            async fn curate(&self, _messages: &[Message]) -> anyhow::Result<usize> {
                Ok(0)
            }
            async fn sync(&self) -> anyhow::Result<()> {
                Ok(())
            }
            fn name(&self) -> &str {
                "broken"
            }
            fn is_available(&self) -> bool {
                true
            }
        }

        let provider = MockProvider::new(vec![Scripted::Text("fine")]);
        let agent = agent(provider, Arc::new(ToolRegistry::new()))
            .with_memory(Arc::new(BrokenMemory));
        let session = Arc::new(Session::new("cli:t"));
        let cancel = CancellationToken::new();

        let reply = agent.handle_message(&session, "hi", &cancel).await.unwrap();
        assert_eq!(reply, "fine");
    }

    #[tokio::test]
    async fn test_locker_serializes_session_operations() {
        let provider = MockProvider::new(vec![Scripted::Text("one"), Scripted::Text("two")]);
        let agent = Arc::new(
            agent(provider, Arc::new(ToolRegistry::new())).with_locker(SessionLocker::new()),
        );
        let session = Arc::new(Session::new("cli:t"));
        let cancel = CancellationToken::new();

        let a = {
            let agent = Arc::clone(&agent);
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.handle_message(&session, "first", &cancel).await })
        };
        let b = {
            let agent = Arc::clone(&agent);
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.handle_message(&session, "second", &cancel).await })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Serialized runs: user/assistant strictly alternate.
        let messages = session.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(messages[3].role, Role::Assistant);
    }
}
