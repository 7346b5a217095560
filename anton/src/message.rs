//! Conversation history types.
//!
//! The kernel never talks to a model directly, but two of its subsystems
//! operate on session histories: the context-budget manager rewrites them,
//! and the tool-loop detector watches the tool calls flowing through them.
//! This module defines the shared message shape both rely on.
//!
//! Invariant (preserved by the compactor): every [`MessageRole::Tool`]
//! message is preceded, directly or across a contiguous run of tool
//! results, by an assistant message carrying a tool call with a matching
//! id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message providing instructions.
    System,
    /// User (or controller-authored) message.
    User,
    /// Assistant (model) message, possibly carrying tool calls.
    Assistant,
    /// Tool result message, referencing the call that produced it.
    Tool,
}

impl MessageRole {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool call issued by an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for the call.
    pub id: String,
    /// Name of the tool.
    pub name: String,
    /// Arguments passed to the tool.
    pub arguments: Value,
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Size in characters of the serialized arguments, used by token
    /// estimation.
    #[must_use]
    pub fn arguments_len(&self) -> usize {
        serde_json::to_string(&self.arguments).map_or(0, |s| s.len())
    }
}

/// A message in a session history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: MessageRole,

    /// Text content. Empty for pure tool-call messages.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,

    /// Tool calls issued by this message (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Back-reference to the tool call this message answers (tool messages
    /// only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a new system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a new user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a new assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a new assistant message carrying tool calls.
    #[must_use]
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Create a new tool result message.
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Whether this message issues tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// The tool call with the given id, if this message issued it.
    #[must_use]
    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, MessageRole::System);
        assert_eq!(ChatMessage::user("u").role, MessageRole::User);
        assert_eq!(ChatMessage::assistant("a").role, MessageRole::Assistant);
        let tool = ChatMessage::tool("call_1", "ok");
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn tool_call_lookup() {
        let msg = ChatMessage::assistant_with_tool_calls(
            "",
            vec![
                ToolCall::new("c1", "read_file", json!({"path": "a.rs"})),
                ToolCall::new("c2", "exec", json!({"cmd": "ls"})),
            ],
        );
        assert!(msg.has_tool_calls());
        assert_eq!(msg.tool_call("c2").map(|c| c.name.as_str()), Some("exec"));
        assert!(msg.tool_call("c3").is_none());
    }

    #[test]
    fn serde_skips_empty_fields() {
        let v = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert!(v.get("tool_calls").is_none());
        assert!(v.get("tool_call_id").is_none());
    }
}
