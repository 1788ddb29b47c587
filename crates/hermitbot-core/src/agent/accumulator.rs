//! Streaming delta accumulator.
//!
//! Folds a sequence of [`StreamDelta`]s into the single assistant message
//! the loop appends to the session. Tool-call fragments accumulate by
//! their position in each delta's array: the first fragment at an index
//! carries `id`/`name`, later fragments append raw argument bytes.

use tracing::warn;

use crate::provider::types::{Message, StreamDelta, ToolCall, Usage};

/// Upper bound on per-iteration tool calls; fragments beyond it are
/// silently dropped.
const MAX_STREAM_TOOL_CALLS: usize = 50;

#[derive(Default)]
pub struct StreamAccumulator {
    content: String,
    thinking: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    done: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one delta into the accumulated state.
    pub fn push(&mut self, delta: &StreamDelta) {
        if let Some(content) = &delta.content {
            self.content.push_str(content);
        }
        if let Some(thinking) = &delta.thinking {
            self.thinking.push_str(thinking);
        }
        if let Some(fragments) = &delta.tool_calls {
            for (idx, fragment) in fragments.iter().enumerate() {
                if idx >= MAX_STREAM_TOOL_CALLS {
                    warn!(idx, "Dropping tool-call fragment beyond bound");
                    continue;
                }
                while self.tool_calls.len() <= idx {
                    self.tool_calls.push(ToolCall::default());
                }
                let slot = &mut self.tool_calls[idx];
                if !fragment.id.is_empty() {
                    slot.id = fragment.id.clone();
                }
                if !fragment.name.is_empty() {
                    slot.name = fragment.name.clone();
                }
                slot.arguments.push_str(&fragment.arguments);
            }
        }
        if let Some(usage) = delta.usage {
            self.usage = Some(usage);
        }
        if delta.done {
            self.done = true;
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Final usage — the last non-empty value seen on the stream.
    pub fn usage(&self) -> Usage {
        self.usage.unwrap_or_default()
    }

    /// Build the accumulated assistant message. Timestamp is set here.
    pub fn into_message(self) -> Message {
        let mut msg = Message::assistant_with_tool_calls(self.content, self.tool_calls);
        if !self.thinking.is_empty() {
            msg.thinking = Some(self.thinking);
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::ToolCallDelta;

    fn content_delta(s: &str) -> StreamDelta {
        StreamDelta {
            content: Some(s.to_string()),
            ..StreamDelta::default()
        }
    }

    fn call_delta(fragments: Vec<ToolCallDelta>) -> StreamDelta {
        StreamDelta {
            tool_calls: Some(fragments),
            ..StreamDelta::default()
        }
    }

    #[test]
    fn test_fragmented_stream_reassembles() {
        let mut acc = StreamAccumulator::new();
        acc.push(&content_delta("He"));
        acc.push(&content_delta("llo"));
        acc.push(&call_delta(vec![ToolCallDelta {
            id: "c1".into(),
            name: "search".into(),
            arguments: String::new(),
        }]));
        acc.push(&call_delta(vec![ToolCallDelta {
            arguments: "{\"q\":".into(),
            ..ToolCallDelta::default()
        }]));
        acc.push(&call_delta(vec![ToolCallDelta {
            arguments: "\"x\"}".into(),
            ..ToolCallDelta::default()
        }]));
        acc.push(&StreamDelta {
            done: true,
            usage: Some(Usage {
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 15,
            }),
            ..StreamDelta::default()
        });

        assert!(acc.is_done());
        assert_eq!(acc.usage().total_tokens, 15);

        let msg = acc.into_message();
        assert_eq!(msg.content, "Hello");
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].id, "c1");
        assert_eq!(msg.tool_calls[0].name, "search");
        assert_eq!(msg.tool_calls[0].arguments, "{\"q\":\"x\"}");
    }

    #[test]
    fn test_parallel_calls_accumulate_by_index() {
        let mut acc = StreamAccumulator::new();
        acc.push(&call_delta(vec![
            ToolCallDelta {
                id: "a".into(),
                name: "weather".into(),
                arguments: "{\"city\":".into(),
            },
            ToolCallDelta {
                id: "b".into(),
                name: "time".into(),
                arguments: "{}".into(),
            },
        ]));
        acc.push(&call_delta(vec![ToolCallDelta {
            arguments: "\"Oslo\"}".into(),
            ..ToolCallDelta::default()
        }]));

        let msg = acc.into_message();
        assert_eq!(msg.tool_calls.len(), 2);
        assert_eq!(msg.tool_calls[0].arguments, "{\"city\":\"Oslo\"}");
        assert_eq!(msg.tool_calls[1].id, "b");
    }

    #[test]
    fn test_sparse_index_leaves_placeholder() {
        // A fragment arriving at index 1 with nothing at index 0 grows the
        // vector; the placeholder at index 0 is preserved, not elided.
        let mut acc = StreamAccumulator::new();
        acc.push(&call_delta(vec![
            ToolCallDelta::default(),
            ToolCallDelta {
                id: "x".into(),
                name: "n".into(),
                arguments: "{}".into(),
            },
        ]));

        let msg = acc.into_message();
        assert_eq!(msg.tool_calls.len(), 2);
        assert_eq!(msg.tool_calls[0], ToolCall::default());
        assert_eq!(msg.tool_calls[1].id, "x");
    }

    #[test]
    fn test_excess_indices_dropped() {
        let fragments: Vec<ToolCallDelta> = (0..60)
            .map(|i| ToolCallDelta {
                id: format!("c{i}"),
                ..ToolCallDelta::default()
            })
            .collect();
        let mut acc = StreamAccumulator::new();
        acc.push(&call_delta(fragments));

        let msg = acc.into_message();
        assert_eq!(msg.tool_calls.len(), 50);
    }

    #[test]
    fn test_last_usage_wins() {
        let mut acc = StreamAccumulator::new();
        acc.push(&StreamDelta {
            usage: Some(Usage {
                total_tokens: 5,
                ..Usage::default()
            }),
            ..StreamDelta::default()
        });
        acc.push(&content_delta("x"));
        acc.push(&StreamDelta {
            usage: Some(Usage {
                total_tokens: 9,
                ..Usage::default()
            }),
            ..StreamDelta::default()
        });
        assert_eq!(acc.usage().total_tokens, 9);
    }

    #[test]
    fn test_thinking_accumulates() {
        let mut acc = StreamAccumulator::new();
        acc.push(&StreamDelta {
            thinking: Some("step ".into()),
            ..StreamDelta::default()
        });
        acc.push(&StreamDelta {
            thinking: Some("two".into()),
            ..StreamDelta::default()
        });
        let msg = acc.into_message();
        assert_eq!(msg.thinking.as_deref(), Some("step two"));
    }
}
