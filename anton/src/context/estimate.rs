//! Token estimation over message histories.
//!
//! The estimate is deliberately coarse: characters (plus a fixed
//! per-message overhead and the serialized tool-call payloads) divided by
//! four. Tool schemas are accounted separately by the caller.

use crate::message::ChatMessage;

/// Fixed per-message character overhead (role framing, separators).
pub const MESSAGE_OVERHEAD_CHARS: usize = 20;

/// Characters per estimated token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Character weight of a single message.
#[must_use]
pub fn message_chars(message: &ChatMessage) -> usize {
    let tool_call_chars: usize = message.tool_calls.iter().map(|c| c.arguments_len()).sum();
    message.content.len() + MESSAGE_OVERHEAD_CHARS + tool_call_chars
}

/// Estimated token weight of a single message.
#[must_use]
pub fn message_tokens(message: &ChatMessage) -> usize {
    message_chars(message) / CHARS_PER_TOKEN
}

/// Estimated token weight of a whole history.
#[must_use]
pub fn history_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(message_chars).sum::<usize>() / CHARS_PER_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::message::ToolCall;

    #[test]
    fn content_and_overhead_are_counted() {
        let msg = ChatMessage::user("x".repeat(80));
        assert_eq!(message_chars(&msg), 100);
        assert_eq!(message_tokens(&msg), 25);
    }

    #[test]
    fn tool_call_payloads_add_weight() {
        let plain = ChatMessage::assistant("go");
        let with_call = ChatMessage::assistant_with_tool_calls(
            "go",
            vec![ToolCall::new("c1", "exec", json!({"cmd": "cargo test"}))],
        );
        assert!(message_chars(&with_call) > message_chars(&plain));
    }

    #[test]
    fn history_estimate_is_additive() {
        let msgs = vec![ChatMessage::user("aaaa"), ChatMessage::assistant("bbbb")];
        let sum_chars: usize = msgs.iter().map(message_chars).sum();
        assert_eq!(history_tokens(&msgs), sum_chars / CHARS_PER_TOKEN);
    }
}
