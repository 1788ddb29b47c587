//! Bus message and event types.
//!
//! `InboundMessage`/`OutboundMessage` flow between channels and the router;
//! `Event` is the observability record published on the [`EventBus`]
//! (crate::bus::EventBus) as the core works.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type identifiers emitted by the core.
pub mod topics {
    pub const MESSAGE_RECEIVED: &str = "message.received";
    pub const MESSAGE_SENT: &str = "message.sent";
    pub const LLM_CALL_STARTED: &str = "llm.call.started";
    pub const LLM_CALL_COMPLETED: &str = "llm.call.completed";
    pub const TOOL_CALL_STARTED: &str = "tool.call.started";
    pub const TOOL_CALL_COMPLETED: &str = "tool.call.completed";
    pub const TOOL_APPROVAL_REQUEST: &str = "tool.approval.request";
    pub const TOOL_APPROVAL_RESPONSE: &str = "tool.approval.response";
    pub const STREAM_STARTED: &str = "stream.started";
    pub const STREAM_DELTA: &str = "stream.delta";
    pub const STREAM_COMPLETED: &str = "stream.completed";
    pub const STREAM_ERROR: &str = "stream.error";
    pub const AGENT_ERROR: &str = "agent.error";
    pub const AGENT_DELEGATED: &str = "agent.delegated";
    pub const AGENT_ROUTED: &str = "agent.routed";
    pub const CRON_JOB_CREATED: &str = "cron.job.created";
    pub const CRON_JOB_UPDATED: &str = "cron.job.updated";
    pub const CRON_JOB_DELETED: &str = "cron.job.deleted";
    pub const CRON_JOB_FIRED: &str = "cron.job.fired";
}

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: &str, session_id: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            session_id: session_id.to_string(),
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// An inbound message from a chat channel to the router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Conversation identifier within the channel.
    pub session_id: String,
    pub content: String,
    /// Source channel identifier (e.g. "telegram", "cli", "cron").
    pub channel_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub is_mention: bool,
}

impl InboundMessage {
    /// A simple CLI inbound message.
    pub fn cli(content: &str) -> Self {
        Self {
            session_id: "direct".into(),
            content: content.into(),
            channel_name: "cli".into(),
            ..Self::default()
        }
    }

    /// The channel-qualified session key used for storage lookups.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel_name, self.session_id)
    }
}

/// An outbound message from the router back to a channel.
///
/// `session_id` is the *original* channel-side id, never the normalized
/// session key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub session_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn reply(session_id: &str, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn error(session_id: &str, content: impl Into<String>) -> Self {
        let mut msg = Self::reply(session_id, content);
        msg.is_error = true;
        msg
    }
}

/// An outbound message paired with the channel that should deliver it.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub channel_name: String,
    pub message: OutboundMessage,
}
