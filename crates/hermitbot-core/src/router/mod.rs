//! Message router.
//!
//! The router sits between channels and agents: it authorizes, scans for
//! secrets, resolves the target agent (single or via an [`AgentRouter`]),
//! runs the hook pipeline, drives the agent, applies onboarding copy,
//! persists the session, and kicks off background memory curation.
//!
//! ## Concurrency model
//!
//! [`Router::serve`] handles each inbound message in its own spawned task,
//! so different sessions process concurrently; within one session the
//! agent's session locker serializes the work.

pub mod offline;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::audit::{AuditEvent, AuditLogger};
use crate::bus::events::{topics, Event, InboundMessage, OutboundEnvelope, OutboundMessage};
use crate::bus::{EventBus, MessageBus};
use crate::error::{DomainError, Sentinel};
use crate::memory::MemoryProvider;
use crate::provider::types::{ChatRequest, Message, Role};
use crate::session::{Session, SessionManager};
use crate::tenant::TenantQuota;
use offline::OfflineManager;

/// Reply used when the scanner blocks a message outright.
const SECRETS_BLOCKED_TEXT: &str =
    "Message blocked: contains sensitive data that cannot be processed.";

/// Message-count milestones that earn the onboarding hint.
const ONBOARDING_MILESTONES: &[usize] = &[5, 10, 20, 50, 100];

/// Budget for one background curation pass.
const CURATOR_TIMEOUT: Duration = Duration::from_secs(30);

/// Permissions the router can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ToolExecute,
}

/// RBAC seam. `check` returns `None` when the message carries no role
/// information (the router then proceeds), `Some(allowed)` otherwise.
pub trait Authorizer: Send + Sync {
    fn check(&self, msg: &InboundMessage, perm: Permission) -> Option<bool>;
}

/// Outcome of scanning one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Clean,
    /// Secrets found and redacted; carry on with the cleaned text.
    Cleaned(String),
    /// Secrets found and the message must not be processed.
    Blocked,
}

pub trait SecretScanner: Send + Sync {
    fn apply(&self, content: &str) -> ScanOutcome;
}

/// Regex-rule scanner. In block mode any match rejects the message;
/// otherwise matches are redacted in place.
pub struct RegexScanner {
    rules: Vec<Regex>,
    block: bool,
}

impl RegexScanner {
    pub fn new(rules: Vec<Regex>, block: bool) -> Self {
        Self { rules, block }
    }

    /// Common credential shapes: provider API keys, bearer tokens, PEM
    /// private key blocks.
    pub fn with_default_rules(block: bool) -> Self {
        let patterns = [
            r"sk-[A-Za-z0-9_-]{20,}",
            r"(?i)bearer\s+[A-Za-z0-9._~+/-]{16,}=*",
            r"-----BEGIN [A-Z ]*PRIVATE KEY-----",
            r"(?i)aws_secret_access_key\s*[:=]\s*\S+",
            r"ghp_[A-Za-z0-9]{36}",
        ];
        let rules = patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self::new(rules, block)
    }
}

impl SecretScanner for RegexScanner {
    fn apply(&self, content: &str) -> ScanOutcome {
        let matched = self.rules.iter().any(|rule| rule.is_match(content));
        if !matched {
            return ScanOutcome::Clean;
        }
        if self.block {
            return ScanOutcome::Blocked;
        }
        let mut cleaned = content.to_string();
        for rule in &self.rules {
            cleaned = rule.replace_all(&cleaned, "[REDACTED]").into_owned();
        }
        ScanOutcome::Cleaned(cleaned)
    }
}

/// Multi-agent dispatch seam: maps an inbound message to an agent id.
pub trait AgentRouter: Send + Sync {
    fn route(&self, msg: &InboundMessage) -> String;
}

/// Pre-agent hook. Errors are logged and skipped.
#[async_trait]
pub trait InboundHook: Send + Sync {
    async fn on_message_received(&self, msg: &InboundMessage) -> anyhow::Result<()>;
}

/// Post-agent hook; may rewrite the reply. Errors are logged and the
/// previous content is kept.
#[async_trait]
pub trait ResponseHook: Send + Sync {
    async fn on_response_ready(&self, msg: &InboundMessage, content: String)
        -> anyhow::Result<String>;
}

/// First-contact and milestone copy.
#[derive(Debug, Clone, Default)]
pub struct OnboardingConfig {
    /// Per-channel welcome text, prepended after the first exchange.
    pub welcome: HashMap<String, String>,
    /// Appended at message-count milestones.
    pub milestone_hint: String,
}

struct AgentEntry {
    agent: Arc<Agent>,
    sessions: Arc<SessionManager>,
}

pub struct Router {
    agents: HashMap<String, AgentEntry>,
    default_agent: String,
    agent_router: Option<Arc<dyn AgentRouter>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    scanner: Option<Arc<dyn SecretScanner>>,
    inbound_hooks: Vec<Arc<dyn InboundHook>>,
    response_hooks: Vec<Arc<dyn ResponseHook>>,
    bus: Option<Arc<EventBus>>,
    audit: Option<Arc<dyn AuditLogger>>,
    memory: Option<Arc<dyn MemoryProvider>>,
    offline: Option<OfflineManager>,
    quota: Option<Arc<TenantQuota>>,
    onboarding: Option<OnboardingConfig>,
    curators: TaskTracker,
}

impl Router {
    /// Single-agent router.
    pub fn new(agent: Arc<Agent>, sessions: Arc<SessionManager>) -> Self {
        let default_agent = agent.id().to_string();
        let mut agents = HashMap::new();
        agents.insert(default_agent.clone(), AgentEntry { agent, sessions });
        Self {
            agents,
            default_agent,
            agent_router: None,
            authorizer: None,
            scanner: None,
            inbound_hooks: Vec::new(),
            response_hooks: Vec::new(),
            bus: None,
            audit: None,
            memory: None,
            offline: None,
            quota: None,
            onboarding: None,
            curators: TaskTracker::new(),
        }
    }

    /// Register an additional agent for multi-agent dispatch.
    pub fn with_agent(mut self, agent: Arc<Agent>, sessions: Arc<SessionManager>) -> Self {
        self.agents
            .insert(agent.id().to_string(), AgentEntry { agent, sessions });
        self
    }

    pub fn with_agent_router(mut self, agent_router: Arc<dyn AgentRouter>) -> Self {
        self.agent_router = Some(agent_router);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn SecretScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn on_message_received(mut self, hook: Arc<dyn InboundHook>) -> Self {
        self.inbound_hooks.push(hook);
        self
    }

    pub fn on_response_ready(mut self, hook: Arc<dyn ResponseHook>) -> Self {
        self.response_hooks.push(hook);
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

    pub fn with_curator(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_offline(mut self, offline: OfflineManager) -> Self {
        self.offline = Some(offline);
        self
    }

    pub fn with_quota(mut self, quota: Arc<TenantQuota>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_onboarding(mut self, onboarding: OnboardingConfig) -> Self {
        self.onboarding = Some(onboarding);
        self
    }

    /// Handle one inbound message synchronously.
    pub async fn handle(
        &self,
        msg: &InboundMessage,
        cancel: &CancellationToken,
    ) -> anyhow::Result<OutboundMessage> {
        self.process(msg, false, cancel).await
    }

    /// Handle one inbound message, streaming deltas through the event bus.
    pub async fn handle_stream(
        &self,
        msg: &InboundMessage,
        cancel: &CancellationToken,
    ) -> anyhow::Result<OutboundMessage> {
        self.process(msg, true, cancel).await
    }

    async fn process(
        &self,
        msg: &InboundMessage,
        streaming: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<OutboundMessage> {
        if let Some(authorizer) = &self.authorizer {
            if let Some(allowed) = authorizer.check(msg, Permission::ToolExecute) {
                if !allowed {
                    return Err(DomainError::new("Router.Handle", Sentinel::Forbidden).into());
                }
            }
        }

        let entry = self.resolve(msg)?;
        let session_key = msg.session_key();

        let mut content = msg.content.clone();
        if let Some(scanner) = &self.scanner {
            match scanner.apply(&content) {
                ScanOutcome::Blocked => {
                    warn!(session = %session_key, "Inbound message blocked by secret scanner");
                    self.audit_event("message.blocked", &session_key, false);
                    return Ok(OutboundMessage::error(&msg.session_id, SECRETS_BLOCKED_TEXT));
                }
                ScanOutcome::Cleaned(cleaned) => {
                    info!(session = %session_key, "Secrets redacted from inbound message");
                    content = cleaned;
                }
                ScanOutcome::Clean => {}
            }
        }

        let session = entry.sessions.get_or_create(&session_key);

        if let Some(quota) = &self.quota {
            if let Some(tenant) = session.tenant_id() {
                quota.check_and_increment(tenant)?;
                self.audit_event("tenant.quota", tenant, true);
            }
        }

        for hook in &self.inbound_hooks {
            if let Err(e) = hook.on_message_received(msg).await {
                warn!(error = %e, "OnMessageReceived hook failed");
            }
        }

        self.publish(
            topics::MESSAGE_RECEIVED,
            session.id(),
            json!({"channel": &msg.channel_name}),
        );

        let result = if streaming {
            entry
                .agent
                .handle_message_stream(&session, &content, cancel)
                .await
        } else {
            entry.agent.handle_message(&session, &content, cancel).await
        };

        let mut reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                self.publish(
                    topics::AGENT_ERROR,
                    session.id(),
                    json!({"error": format!("{err:#}")}),
                );
                match self.offline_fallback(&session, &content, &err).await {
                    Some(fallback) => fallback,
                    None => return Err(err.context("Router.Handle")),
                }
            }
        };

        reply = self.apply_onboarding(msg, &session, reply);

        for hook in &self.response_hooks {
            match hook.on_response_ready(msg, reply.clone()).await {
                Ok(rewritten) => reply = rewritten,
                Err(e) => warn!(error = %e, "OnResponseReady hook failed"),
            }
        }

        self.publish(topics::MESSAGE_SENT, session.id(), json!(null));

        if let Err(e) = entry.sessions.save(&session) {
            warn!(error = %e, session = session.id(), "Failed to persist session");
        }

        self.curate(&session);

        let mut outbound = OutboundMessage::reply(&msg.session_id, reply);
        outbound.thread_id = msg.thread_id.clone();
        outbound.reply_to_id = msg.reply_to_id.clone();
        Ok(outbound)
    }

    fn resolve(&self, msg: &InboundMessage) -> Result<&AgentEntry, DomainError> {
        let agent_id = match &self.agent_router {
            Some(router) => {
                let id = router.route(msg);
                self.publish(
                    topics::AGENT_ROUTED,
                    &msg.session_key(),
                    json!({"agent": &id}),
                );
                id
            }
            None => self.default_agent.clone(),
        };
        self.agents
            .get(&agent_id)
            .ok_or_else(|| DomainError::new("Router.ResolveAgent", Sentinel::NotFound))
    }

    /// Local-LLM fallback when the provider is unreachable.
    async fn offline_fallback(
        &self,
        session: &Arc<Session>,
        content: &str,
        err: &anyhow::Error,
    ) -> Option<String> {
        let offline = self.offline.as_ref()?;
        if offline.is_online().await {
            return None;
        }
        warn!(error = %err, "Provider failed while offline; using local fallback");

        let mut messages = session.messages();
        let has_trailing_user = messages
            .last()
            .is_some_and(|m| m.role == Role::User && m.content == content);
        if !has_trailing_user {
            messages.push(Message::user(content));
        }
        let req = ChatRequest {
            model: None,
            messages,
            tools: Vec::new(),
            max_tokens: 1024,
            temperature: 0.7,
            thinking_budget: None,
        };
        match offline.fallback_chat(&req).await {
            Ok(resp) => {
                session.append(resp.message.clone());
                Some(resp.message.content)
            }
            Err(fallback_err) => {
                warn!(error = %fallback_err, "Offline fallback provider failed too");
                None
            }
        }
    }

    fn apply_onboarding(
        &self,
        msg: &InboundMessage,
        session: &Session,
        mut reply: String,
    ) -> String {
        let Some(onboarding) = &self.onboarding else {
            return reply;
        };
        let count = session.len();
        if count == 2 {
            if let Some(welcome) = onboarding.welcome.get(&msg.channel_name) {
                reply = format!("{welcome}\n\n{reply}");
            }
        }
        if ONBOARDING_MILESTONES.contains(&count) && !onboarding.milestone_hint.is_empty() {
            reply = format!("{reply}\n\n{}", onboarding.milestone_hint);
        }
        reply
    }

    /// Detached background curation with its own timeout. Tracked so
    /// [`Router::shutdown`] can drain.
    fn curate(&self, session: &Arc<Session>) {
        let Some(memory) = &self.memory else {
            return;
        };
        let memory = Arc::clone(memory);
        let messages = session.messages();
        let session_id = session.id().to_string();
        self.curators.spawn(async move {
            match tokio::time::timeout(CURATOR_TIMEOUT, memory.curate(&messages)).await {
                Ok(Ok(stored)) => debug!(stored, session = %session_id, "Curated memories"),
                Ok(Err(e)) => warn!(error = %e, session = %session_id, "Memory curation failed"),
                Err(_) => warn!(session = %session_id, "Memory curation timed out"),
            }
        });
    }

    /// Wait for in-flight curation tasks to finish.
    pub async fn shutdown(&self) {
        self.curators.close();
        self.curators.wait().await;
    }

    /// Bridge loop: receive inbound messages from the bus, process each in
    /// its own task, publish outbound envelopes.
    pub async fn serve(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        bus: Arc<MessageBus>,
        cancel: CancellationToken,
    ) {
        info!("Router bridge started, waiting for inbound messages");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Router bridge received shutdown signal");
                    break;
                }
                msg = inbound_rx.recv() => {
                    let Some(msg) = msg else { break };
                    debug!(channel = %msg.channel_name, session = %msg.session_id, "Bridge received message");
                    let router = Arc::clone(&self);
                    let bus = Arc::clone(&bus);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let channel = msg.channel_name.clone();
                        let session_id = msg.session_id.clone();
                        let outbound = match router.handle(&msg, &cancel).await {
                            Ok(outbound) => outbound,
                            Err(e) => {
                                error!(error = %e, "Error processing message");
                                OutboundMessage::error(&session_id, format!("Error: {e:#}"))
                            }
                        };
                        bus.publish_outbound(OutboundEnvelope {
                            channel_name: channel,
                            message: outbound,
                        })
                        .await;
                    });
                }
            }
        }
        info!("Router bridge shutting down");
    }

    fn publish(&self, topic: &str, session_id: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(Event::new(topic, session_id).with_payload(payload));
        }
    }

    fn audit_event(&self, action: &str, subject: &str, success: bool) {
        if let Some(audit) = &self.audit {
            audit.log(AuditEvent::new(action, subject, success));
        }
    }
}

/// Cron jobs drive the router exactly like a channel does.
#[async_trait]
impl crate::cron::MessageHandler for Router {
    async fn handle(&self, msg: InboundMessage) -> anyhow::Result<OutboundMessage> {
        Router::handle(self, &msg, &CancellationToken::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::context::{ContextBuilder, ContextConfig};
    use crate::agent::AgentConfig;
    use crate::memory::MemoryEntry;
    use crate::provider::types::{ChatResponse, Usage};
    use crate::provider::LlmProvider;
    use crate::tools::ToolRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        async fn chat(&self, req: &ChatRequest) -> anyhow::Result<ChatResponse> {
            let last = req.messages.last().unwrap().content.clone();
            Ok(ChatResponse {
                message: Message::assistant(format!("echo: {last}")),
                usage: Usage::default(),
            })
        }
        fn name(&self) -> &str {
            "echo"
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl LlmProvider for FailingProvider {
        async fn chat(&self, _req: &ChatRequest) -> anyhow::Result<ChatResponse> {
            anyhow::bail!("connection refused")
        }
        fn name(&self) -> &str {
            "failing"
        }
    }

    fn build_agent(provider: Arc<dyn LlmProvider>, id: &str) -> Arc<Agent> {
        Arc::new(Agent::new(
            provider,
            Arc::new(ToolRegistry::new()),
            ContextBuilder::new(ContextConfig::default()),
            AgentConfig {
                id: id.to_string(),
                ..AgentConfig::default()
            },
        ))
    }

    fn build_router(dir: &std::path::Path) -> Router {
        let sessions = Arc::new(SessionManager::new(dir).unwrap());
        Router::new(build_agent(Arc::new(EchoProvider), "main"), sessions)
    }

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            session_id: "chat42".into(),
            content: content.into(),
            channel_name: "telegram".into(),
            ..InboundMessage::default()
        }
    }

    #[tokio::test]
    async fn test_handle_round_trip_preserves_original_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path());
        let cancel = CancellationToken::new();

        let out = router.handle(&inbound("hello"), &cancel).await.unwrap();
        assert_eq!(out.session_id, "chat42", "original id, not the session key");
        assert_eq!(out.content, "echo: hello");
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn test_session_is_persisted_under_channel_key() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionManager::new(dir.path()).unwrap());
        let router = Router::new(
            build_agent(Arc::new(EchoProvider), "main"),
            Arc::clone(&sessions),
        );
        let cancel = CancellationToken::new();

        router.handle(&inbound("hello"), &cancel).await.unwrap();

        let session = sessions.get("telegram:chat42").expect("session created");
        assert_eq!(session.len(), 2);
        // One JSON file landed on disk for it.
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_scanner_blocks_with_synthetic_error_outbound() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path())
            .with_scanner(Arc::new(RegexScanner::with_default_rules(true)));
        let cancel = CancellationToken::new();

        let out = router
            .handle(
                &inbound("my key is sk-abcdefghijklmnopqrstuvwxyz123456"),
                &cancel,
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert_eq!(out.session_id, "chat42");
        assert_eq!(out.content, SECRETS_BLOCKED_TEXT);
    }

    #[tokio::test]
    async fn test_scanner_redacts_in_clean_mode() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path())
            .with_scanner(Arc::new(RegexScanner::with_default_rules(false)));
        let cancel = CancellationToken::new();

        let out = router
            .handle(
                &inbound("token: sk-abcdefghijklmnopqrstuvwxyz123456 please"),
                &cancel,
            )
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.content.contains("[REDACTED]"));
        assert!(!out.content.contains("sk-abcdefghijklmnop"));
    }

    #[tokio::test]
    async fn test_forbidden_when_authorizer_denies() {
        struct DenyAll;
        impl Authorizer for DenyAll {
            fn check(&self, _msg: &InboundMessage, _perm: Permission) -> Option<bool> {
                Some(false)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path()).with_authorizer(Arc::new(DenyAll));
        let cancel = CancellationToken::new();

        let err = router.handle(&inbound("hi"), &cancel).await.unwrap_err();
        assert_eq!(
            crate::error::error_code_of_any(&err),
            crate::error::ErrorCode::Forbidden
        );
    }

    #[tokio::test]
    async fn test_authorizer_without_roles_proceeds() {
        struct NoRoles;
        impl Authorizer for NoRoles {
            fn check(&self, _msg: &InboundMessage, _perm: Permission) -> Option<bool> {
                None
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path()).with_authorizer(Arc::new(NoRoles));
        let cancel = CancellationToken::new();
        assert!(router.handle(&inbound("hi"), &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_response_hooks_rewrite_in_order() {
        struct Suffix(&'static str);
        #[async_trait]
        impl ResponseHook for Suffix {
            async fn on_response_ready(
                &self,
                _msg: &InboundMessage,
                content: String,
            ) -> anyhow::Result<String> {
                Ok(format!("{content}{}", self.0))
            }
        }
        struct Failing;
        #[async_trait]
        impl ResponseHook for Failing {
            async fn on_response_ready(
                &self,
                _msg: &InboundMessage,
                _content: String,
            ) -> anyhow::Result<String> {
                anyhow::bail!("hook broke")
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path())
            .on_response_ready(Arc::new(Suffix(" [one]")))
            .on_response_ready(Arc::new(Failing))
            .on_response_ready(Arc::new(Suffix(" [two]")));
        let cancel = CancellationToken::new();

        let out = router.handle(&inbound("hi"), &cancel).await.unwrap();
        assert_eq!(out.content, "echo: hi [one] [two]");
    }

    #[tokio::test]
    async fn test_onboarding_welcome_on_first_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let mut welcome = HashMap::new();
        welcome.insert("telegram".to_string(), "Welcome aboard!".to_string());
        let router = build_router(dir.path()).with_onboarding(OnboardingConfig {
            welcome,
            milestone_hint: String::new(),
        });
        let cancel = CancellationToken::new();

        let first = router.handle(&inbound("hello"), &cancel).await.unwrap();
        assert!(first.content.starts_with("Welcome aboard!\n\n"));

        let second = router.handle(&inbound("again"), &cancel).await.unwrap();
        assert!(!second.content.contains("Welcome aboard!"));
    }

    #[tokio::test]
    async fn test_onboarding_milestone_hint() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path()).with_onboarding(OnboardingConfig {
            welcome: HashMap::new(),
            milestone_hint: "Tip: try /help".to_string(),
        });
        let cancel = CancellationToken::new();

        // Five messages in: after the 2nd exchange the count reaches 4,
        // after the 3rd it reaches 6 — the hint fires when a reply lands
        // exactly on a milestone count.
        let mut hinted = 0;
        for i in 0..5 {
            let out = router
                .handle(&inbound(&format!("msg {i}")), &cancel)
                .await
                .unwrap();
            if out.content.contains("Tip: try /help") {
                hinted += 1;
            }
        }
        // Counts seen: 2, 4, 6, 8, 10 → exactly one milestone (10).
        assert_eq!(hinted, 1);
    }

    #[tokio::test]
    async fn test_agent_failure_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionManager::new(dir.path()).unwrap());
        let router = Router::new(build_agent(Arc::new(FailingProvider), "main"), sessions);
        let cancel = CancellationToken::new();

        let err = router.handle(&inbound("hi"), &cancel).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_offline_fallback_answers_when_unreachable() {
        struct LocalStub;
        #[async_trait]
        impl LlmProvider for LocalStub {
            async fn chat(&self, _req: &ChatRequest) -> anyhow::Result<ChatResponse> {
                Ok(ChatResponse {
                    message: Message::assistant("offline answer"),
                    usage: Usage::default(),
                })
            }
            fn name(&self) -> &str {
                "local"
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionManager::new(dir.path()).unwrap());
        let router = Router::new(build_agent(Arc::new(FailingProvider), "main"), sessions)
            .with_offline(OfflineManager::with_probe_url(
                "http://127.0.0.1:1/",
                Arc::new(LocalStub),
            ));
        let cancel = CancellationToken::new();

        let out = router.handle(&inbound("hi"), &cancel).await.unwrap();
        assert_eq!(out.content, "offline answer");
    }

    #[tokio::test]
    async fn test_multi_agent_routing() {
        struct ByPrefix;
        impl AgentRouter for ByPrefix {
            fn route(&self, msg: &InboundMessage) -> String {
                if msg.content.starts_with("ops:") {
                    "ops".to_string()
                } else {
                    "main".to_string()
                }
            }
        }

        struct NamedProvider(&'static str);
        #[async_trait]
        impl LlmProvider for NamedProvider {
            async fn chat(&self, _req: &ChatRequest) -> anyhow::Result<ChatResponse> {
                Ok(ChatResponse {
                    message: Message::assistant(self.0),
                    usage: Usage::default(),
                })
            }
            fn name(&self) -> &str {
                self.0
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let sessions_a = Arc::new(SessionManager::new(&dir.path().join("a")).unwrap());
        let sessions_b = Arc::new(SessionManager::new(&dir.path().join("b")).unwrap());
        let router = Router::new(
            build_agent(Arc::new(NamedProvider("from main")), "main"),
            sessions_a,
        )
        .with_agent(build_agent(Arc::new(NamedProvider("from ops")), "ops"), sessions_b)
        .with_agent_router(Arc::new(ByPrefix));
        let cancel = CancellationToken::new();

        let out = router.handle(&inbound("ops: restart"), &cancel).await.unwrap();
        assert_eq!(out.content, "from ops");
        let out = router.handle(&inbound("hello"), &cancel).await.unwrap();
        assert_eq!(out.content, "from main");
    }

    #[tokio::test]
    async fn test_curator_runs_in_background() {
        struct CountingMemory {
            curated: AtomicUsize,
        }
        #[async_trait]
        impl MemoryProvider for CountingMemory {
            async fn store(&self, _entry: MemoryEntry) -> anyhow::Result<()> {
                Ok(())
            }
            async fn query(&self, _text: &str, _limit: usize) -> anyhow::Result<Vec<MemoryEntry>> {
                Ok(Vec::new())
            }
            async fn delete(&self, _id: &str) -> anyhow::Result<()> {
                Ok(())
            }
            async fn curate(&self, messages: &[Message]) -> anyhow::Result<usize> {
                self.curated.fetch_add(messages.len(), Ordering::SeqCst);
                Ok(1)
            }
            async fn sync(&self) -> anyhow::Result<()> {
                Ok(())
            }
            fn name(&self) -> &str {
                "counting"
            }
            fn is_available(&self) -> bool {
                true
            }
        }

        let memory = Arc::new(CountingMemory {
            curated: AtomicUsize::new(0),
        });
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path()).with_curator(memory.clone());
        let cancel = CancellationToken::new();

        router.handle(&inbound("hi"), &cancel).await.unwrap();
        router.shutdown().await;

        assert_eq!(
            memory.curated.load(Ordering::SeqCst),
            2,
            "curator saw user + assistant"
        );
    }

    #[tokio::test]
    async fn test_inbound_hook_errors_are_nonfatal() {
        struct Failing;
        #[async_trait]
        impl InboundHook for Failing {
            async fn on_message_received(&self, _msg: &InboundMessage) -> anyhow::Result<()> {
                anyhow::bail!("inbound hook broke")
            }
        }
        struct Recording {
            seen: Mutex<Vec<String>>,
        }
        #[async_trait]
        impl InboundHook for Recording {
            async fn on_message_received(&self, msg: &InboundMessage) -> anyhow::Result<()> {
                self.seen.lock().unwrap().push(msg.content.clone());
                Ok(())
            }
        }

        let recording = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path())
            .on_message_received(Arc::new(Failing))
            .on_message_received(recording.clone());
        let cancel = CancellationToken::new();

        let out = router.handle(&inbound("still works"), &cancel).await.unwrap();
        assert_eq!(out.content, "echo: still works");
        assert_eq!(recording.seen.lock().unwrap().as_slice(), ["still works"]);
    }

    #[tokio::test]
    async fn test_serve_bridges_inbound_to_outbound() {
        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(build_router(dir.path()));
        let (bus, receivers) = MessageBus::new(16);
        let bus = Arc::new(bus);
        let cancel = CancellationToken::new();

        let captured = Arc::new(tokio::sync::RwLock::new(Vec::<String>::new()));
        let c = Arc::clone(&captured);
        bus.subscribe_outbound("telegram", move |envelope| {
            let c = Arc::clone(&c);
            async move {
                c.write().await.push(envelope.message.content);
            }
        })
        .await;

        let dispatch = tokio::spawn(crate::bus::dispatch_outbound(
            bus.subscribers(),
            receivers.outbound_rx,
        ));
        let serve = tokio::spawn(Arc::clone(&router).serve(
            receivers.inbound_rx,
            Arc::clone(&bus),
            cancel.clone(),
        ));

        bus.inbound_sender().send(inbound("ping")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(captured.read().await.as_slice(), ["echo: ping"]);

        cancel.cancel();
        let _ = serve.await;
        drop(bus);
        let _ = dispatch.await;
    }
}
