//! Conversation data model.
//!
//! `ConversationTurn`s form the in-memory history; `ToolInvocation`s record
//! tool activity within a turn; `TurnResult` is what a caller receives when a
//! turn finishes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response text used when a turn completes without producing any text.
pub const NO_RESPONSE_PLACEHOLDER: &str = "No response generated";

/// Prefix marking synthesized error text so it cannot be mistaken for an
/// assistant reply.
pub const ERROR_PREFIX: &str = "[error]";

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One entry of the conversation history. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            tool_calls,
        }
    }
}

/// A single tool call observed in the upstream stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Upstream tool-use id, when the backend provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
    /// Monotonic milliseconds since the adapter was created.
    pub requested_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

impl ToolInvocation {
    pub fn is_pending(&self) -> bool {
        self.output.is_none()
    }
}

/// Final outcome of one `converse()` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    /// Never empty.
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub cost_usd: f64,
    pub tools_used: Vec<ToolInvocation>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    /// Error description for failed turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TurnResult {
    /// True when the turn completed but produced no text at all.
    pub fn is_placeholder(&self) -> bool {
        self.response == NO_RESPONSE_PLACEHOLDER
    }

    /// True when the response text was synthesized from an error rather than
    /// recovered from assistant output.
    pub fn is_synthesized_error(&self) -> bool {
        self.response.starts_with(ERROR_PREFIX)
    }
}
