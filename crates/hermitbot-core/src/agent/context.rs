//! Context builder for assembling chat requests.
//!
//! Assembles the system prompt (identity + memory context + skills), runs
//! transcript repair, and truncates the history to the message budget
//! without ever splitting a tool-call group.

use crate::agent::compress::COMPRESS_SUMMARY_NAME;
use crate::agent::repair::repair_transcript;
use crate::memory::MemoryEntry;
use crate::provider::types::{ChatRequest, Message, Role, ToolSchema};

/// A named capability advertised in the system prompt.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub kind: SkillKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillKind {
    /// Included in the `## Available Skills` prompt block.
    Prompt,
    /// Reached through a tool; not listed in the prompt.
    Tool,
}

/// Builder configuration.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub system_prompt: String,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Maximum number of history messages per request.
    pub message_budget: usize,
    pub thinking_budget: Option<u32>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful assistant.".to_string(),
            model: None,
            max_tokens: 4096,
            temperature: 0.7,
            message_budget: 50,
            thinking_budget: None,
        }
    }
}

/// Builds the [`ChatRequest`] for one agent iteration.
pub struct ContextBuilder {
    config: ContextConfig,
    skills: Vec<Skill>,
}

impl ContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            skills: Vec::new(),
        }
    }

    pub fn with_skills(mut self, skills: Vec<Skill>) -> Self {
        self.skills = skills;
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Assemble a request from history, memories, and tool schemas.
    pub fn build(
        &self,
        history: &[Message],
        memories: &[MemoryEntry],
        schemas: Vec<ToolSchema>,
    ) -> ChatRequest {
        let repaired = repair_transcript(history);
        let mut truncated = truncate_preserving_groups(&repaired, self.config.message_budget);

        // The compression anchor at the head of the history must survive
        // truncation, otherwise the model loses everything it summarized.
        let anchor = repaired
            .first()
            .filter(|m| m.name.as_deref() == Some(COMPRESS_SUMMARY_NAME));
        if let Some(anchor) = anchor {
            let starts_with_anchor = truncated
                .first()
                .is_some_and(|m| m.name.as_deref() == Some(COMPRESS_SUMMARY_NAME));
            if !starts_with_anchor {
                truncated.insert(0, anchor.clone());
            }
        }

        let mut messages = Vec::with_capacity(truncated.len() + 1);
        messages.push(Message::system(self.system_content(memories)));
        messages.extend(truncated);

        ChatRequest {
            model: self.config.model.clone(),
            messages,
            tools: schemas,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            thinking_budget: self.config.thinking_budget,
        }
    }

    fn system_content(&self, memories: &[MemoryEntry]) -> String {
        let mut sections = vec![self.config.system_prompt.clone()];

        if !memories.is_empty() {
            let mut block = String::from("## Relevant Memory Context\n");
            for (i, entry) in memories.iter().enumerate() {
                if entry.tags.is_empty() {
                    block.push_str(&format!("{}. {}\n", i + 1, entry.content));
                } else {
                    block.push_str(&format!(
                        "{}. [{}] {}\n",
                        i + 1,
                        entry.tags.join(", "),
                        entry.content
                    ));
                }
            }
            sections.push(block.trim_end().to_string());
        }

        let prompt_skills: Vec<&Skill> = self
            .skills
            .iter()
            .filter(|s| s.kind == SkillKind::Prompt)
            .collect();
        if !prompt_skills.is_empty() {
            let mut block = String::from("## Available Skills\n");
            for skill in prompt_skills {
                block.push_str(&format!("- {}: {}\n", skill.name, skill.description));
            }
            sections.push(block.trim_end().to_string());
        }

        sections.join("\n\n")
    }
}

/// Truncate a history to at most `budget` messages, walking whole groups
/// from the end.
///
/// A group is an assistant message with tool calls plus its contiguous
/// tool results; everything else is a group of one. A group that would
/// exceed the budget is skipped unless nothing has been taken yet, so a
/// single oversized group still yields a non-empty result.
pub fn truncate_preserving_groups(history: &[Message], budget: usize) -> Vec<Message> {
    let groups = partition_groups(history);
    let mut taken: Vec<&[Message]> = Vec::new();
    let mut count = 0usize;

    for group in groups.iter().rev() {
        if count + group.len() <= budget || count == 0 {
            count += group.len();
            taken.push(group);
        }
    }

    taken.reverse();
    taken.into_iter().flatten().cloned().collect()
}

/// Partition a history into atomic groups.
fn partition_groups(history: &[Message]) -> Vec<&[Message]> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < history.len() {
        let start = i;
        if history[i].has_tool_calls() {
            i += 1;
            while i < history.len() && history[i].role == Role::Tool {
                i += 1;
            }
        } else {
            i += 1;
        }
        groups.push(&history[start..i]);
    }
    groups
}
