//! Tool system: trait, registry, scoped executor, and approval seam.
//!
//! Every tool implements the `Tool` trait and registers itself in the
//! `ToolRegistry`. The agent loop resolves tool calls by name through the
//! `ToolExecutor` seam, so a registry, a scoped allow-list wrapper, or a
//! remote dispatcher all look the same to the loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::provider::types::{ToolCall, ToolSchema};

/// Output of one tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub content: String,
}

impl From<String> for ToolResult {
    fn from(content: String) -> Self {
        Self { content }
    }
}

impl From<&str> for ToolResult {
    fn from(content: &str) -> Self {
        Self {
            content: content.to_string(),
        }
    }
}

/// Trait that all agent tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name used in function calls (e.g. "read_file").
    fn name(&self) -> &str;

    /// Human-readable description of what the tool does.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> Value;

    /// Execute the tool with the given JSON arguments.
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult>;
}

/// Resolution + schema listing seam consumed by the agent loop.
pub trait ToolExecutor: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<dyn Tool>>;
    fn schemas(&self) -> Vec<ToolSchema>;
}

/// Approval seam for sensitive tools. `request_approval` may block on a
/// human.
#[async_trait]
pub trait ToolApprover: Send + Sync {
    fn needs_approval(&self, call: &ToolCall) -> bool;
    async fn request_approval(&self, call: &ToolCall) -> anyhow::Result<bool>;
}

/// Dynamic registry for agent tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        debug!(tool = tool.name(), "Registered tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolExecutor for ToolRegistry {
    fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .values()
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }
}

/// Allow-list wrapper around another executor.
///
/// An empty allow-list passes everything through; otherwise names outside
/// the list resolve to `None` and disappear from `schemas()`.
pub struct ScopedExecutor {
    inner: Arc<dyn ToolExecutor>,
    allow: HashSet<String>,
}

impl ScopedExecutor {
    pub fn new(inner: Arc<dyn ToolExecutor>, allow: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner,
            allow: allow.into_iter().collect(),
        }
    }

    fn allowed(&self, name: &str) -> bool {
        self.allow.is_empty() || self.allow.contains(name)
    }
}

impl ToolExecutor for ScopedExecutor {
    fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if !self.allowed(name) {
            return None;
        }
        self.inner.get(name)
    }

    fn schemas(&self) -> Vec<ToolSchema> {
        self.inner
            .schemas()
            .into_iter()
            .filter(|s| self.allowed(&s.name))
            .collect()
    }
}
