//! Raw upstream wire types.
//!
//! Shapes emitted by stream-json agent CLIs, one JSON object per line.
//! Several fields have moved between backend versions, so most of them are
//! optional and the accessors below pick whichever is present.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ============================================================================
// Top-level messages
// ============================================================================

/// One raw message from the upstream stream, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamMessage {
    /// Lifecycle notice; `subtype = "init"` opens a session.
    System(SystemMessage),
    /// Assistant output (text and tool-use blocks).
    Assistant(ChatMessage),
    /// User echo; carries `tool_result` blocks after tool execution.
    User(ChatMessage),
    /// Legacy standalone tool-use message.
    ToolUse(ToolUseMessage),
    /// Legacy standalone tool-result message.
    ToolResult(ToolResultMessage),
    /// Terminal message of a turn.
    Result(ResultMessage),
    /// Unknown message type (forward-compatible).
    #[serde(other)]
    Unknown,
}

impl UpstreamMessage {
    /// The wire discriminator, as used for audit `messageType`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::System(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::ToolUse(_) => "tool_use",
            Self::ToolResult(_) => "tool_result",
            Self::Result(_) => "result",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMessage {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Preserve unknown fields (tools, cwd, mcp servers...).
    #[serde(flatten, default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

impl SystemMessage {
    pub fn is_init(&self) -> bool {
        self.subtype.as_deref() == Some("init")
    }
}

/// Assistant or user message.
///
/// Current backends nest the content under `message.content`; older ones put
/// `content` at the top level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ChatMessage {
    pub fn content(&self) -> Option<&Content> {
        self.message
            .as_ref()
            .and_then(|m| m.content.as_ref())
            .or(self.content.as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
}

/// Message content: a bare string or an ordered list of blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    /// Unknown block type (images, server tools, ...).
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultMessage {
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "output")]
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

/// Terminal message of a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    /// "success", "error_max_turns", "error_during_execution", ...
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    /// Older backends report the final text as `text`.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    /// Older backends report `cost_usd` instead of `total_cost_usd`.
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub is_error: Option<bool>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl ResultMessage {
    pub fn text(&self) -> String {
        self.result
            .clone()
            .or_else(|| self.text.clone())
            .unwrap_or_default()
    }

    pub fn cost(&self) -> f64 {
        self.total_cost_usd.or(self.cost_usd).unwrap_or(0.0)
    }

    /// Explicit flag wins; otherwise any subtype other than "success" is an error.
    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or_else(|| {
            self.subtype
                .as_deref()
                .is_some_and(|subtype| subtype != "success")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_message_prefers_nested_content() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "message": {"content": "nested"},
            "content": "top-level"
        }))
        .unwrap();
        assert!(matches!(msg.content(), Some(Content::Text(t)) if t == "nested"));

        let legacy: ChatMessage = serde_json::from_value(json!({"content": "top-level"})).unwrap();
        assert!(matches!(legacy.content(), Some(Content::Text(t)) if t == "top-level"));
    }

    #[test]
    fn test_unknown_block_type_is_tolerated() {
        let content: Content = serde_json::from_value(json!([
            {"type": "image", "source": {"type": "base64", "data": "..."}},
            {"type": "text", "text": "after image"}
        ]))
        .unwrap();
        let Content::Blocks(blocks) = content else {
            panic!("expected blocks");
        };
        assert!(matches!(blocks[0], ContentBlock::Unknown));
        assert!(matches!(&blocks[1], ContentBlock::Text { text } if text == "after image"));
    }

    #[test]
    fn test_result_message_fallbacks() {
        let msg: ResultMessage = serde_json::from_value(json!({
            "subtype": "error_max_turns",
            "text": "stopped",
            "cost_usd": 0.5
        }))
        .unwrap();
        assert_eq!(msg.text(), "stopped");
        assert!((msg.cost() - 0.5).abs() < f64::EPSILON);
        assert!(msg.is_error());

        let ok: ResultMessage =
            serde_json::from_value(json!({"subtype": "success", "result": "fine"})).unwrap();
        assert!(!ok.is_error());
        assert_eq!(ok.cost(), 0.0);
    }

    #[test]
    fn test_unknown_message_type() {
        let msg: UpstreamMessage =
            serde_json::from_value(json!({"type": "stream_event", "event": {}})).unwrap();
        assert!(matches!(msg, UpstreamMessage::Unknown));
        assert_eq!(msg.type_name(), "unknown");
    }
}
