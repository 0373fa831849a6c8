//! Domain events and caller-visible conversation events.
//!
//! `DomainEvent` is what the decoder produces from raw upstream messages. It is
//! consumed by the hook pipeline and the aggregator and only ever reaches disk
//! wrapped in an `AuditRecord`.
//!
//! `ConverseEvent` is what `converse()` yields to its caller: incremental
//! updates followed by exactly one `Complete`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::{ToolInvocation, TurnResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    /// Upstream opened (or resumed) a session.
    SessionInit {
        session_id: Option<String>,
        model: Option<String>,
    },
    /// A piece of assistant text.
    TextChunk { text: String },
    /// The assistant requested a tool.
    ToolUse {
        name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// A tool returned. `name` is only present when the wire carried it; the
    /// aggregator resolves it from `tool_use_id` otherwise.
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        output: Value,
        is_error: bool,
    },
    /// Terminal result of the turn.
    TurnResult {
        text: String,
        cost_usd: f64,
        session_id: Option<String>,
        num_turns: Option<u32>,
        is_error: bool,
    },
    /// Anything the decoder did not recognize.
    RawPassthrough { payload: Value },
}

impl DomainEvent {
    /// Stable variant name, used as the audit `messageType` of derived records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionInit { .. } => "session_init",
            Self::TextChunk { .. } => "text_chunk",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::TurnResult { .. } => "turn_result",
            Self::RawPassthrough { .. } => "raw_passthrough",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnResult { .. })
    }
}

/// Event yielded to the caller of `converse()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConverseEvent {
    SessionStarted {
        session_id: Option<String>,
        model: Option<String>,
    },
    /// New intermediate assistant text. Never re-sent or retracted.
    Partial { text: String },
    /// A tool invocation was recorded.
    ToolUse { invocation: ToolInvocation },
    /// A tool invocation received its output.
    ToolResult { invocation: ToolInvocation },
    /// Unrecognized upstream message, forwarded as-is.
    Passthrough { payload: Value },
    /// Final result; always the last event of a turn.
    Complete(TurnResult),
}

impl ConverseEvent {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    pub fn into_result(self) -> Option<TurnResult> {
        match self {
            Self::Complete(result) => Some(result),
            _ => None,
        }
    }
}
