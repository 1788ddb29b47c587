//! Transcript repair.
//!
//! Some providers reject histories where an assistant tool-call has no
//! matching tool result, or where a tool result answers nothing. Repair
//! runs before every LLM call and guarantees zero orphan tool messages and
//! zero dangling tool-call groups.

use tracing::debug;

use crate::provider::types::{Message, Role, ToolCall};

/// Content injected for a tool call that never produced a result.
pub const MISSING_RESULT_CONTENT: &str = "[error] tool call did not produce a result";

/// Rewrite a history so that every assistant tool call is answered and
/// every tool message answers a call.
pub fn repair_transcript(history: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(history.len());
    let mut pending: Vec<ToolCall> = Vec::new();

    for msg in history {
        if msg.role == Role::Tool {
            let matched = msg
                .tool_call_id()
                .and_then(|id| pending.iter().position(|c| c.id == id));
            match matched {
                Some(pos) => {
                    pending.remove(pos);
                    out.push(msg.clone());
                }
                None => {
                    debug!(
                        call_id = msg.tool_call_id().unwrap_or(""),
                        "Dropping orphan tool message"
                    );
                }
            }
            continue;
        }

        flush_pending(&mut out, &mut pending);
        out.push(msg.clone());
        if msg.has_tool_calls() {
            pending = msg.tool_calls.clone();
        }
    }

    flush_pending(&mut out, &mut pending);
    out
}

/// Inject a synthetic result for every still-unanswered call.
fn flush_pending(out: &mut Vec<Message>, pending: &mut Vec<ToolCall>) {
    for call in pending.drain(..) {
        debug!(call_id = %call.id, tool = %call.name, "Injecting missing tool result");
        out.push(Message::tool_result(
            &call.id,
            &call.name,
            MISSING_RESULT_CONTENT,
        ));
    }
}
