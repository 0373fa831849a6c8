//! Session management.
//!
//! A [`SessionManager`] owns the conversation history, the upstream handle,
//! the hook pipeline and the audit sink. Each `converse()` call drives one
//! turn through decode, hooks and aggregation and yields caller-visible
//! [`ConverseEvent`](colloquy_protocol::ConverseEvent)s.

mod manager;
mod turn;

pub use manager::SessionManager;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use colloquy_protocol::ConversationTurn;

use crate::upstream::PermissionMode;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// `converse()` was called with an empty or whitespace-only message.
    #[error("message must not be empty")]
    EmptyMessage,

    /// The turn stream ended without producing a result.
    #[error("turn ended without a result")]
    NoResult,
}

/// Called with `(tool_name, input)` after the registered pre-hooks ran.
pub type ToolUseCallback = Box<dyn Fn(&str, &Value) + Send + Sync>;

/// Called with each new intermediate assistant message.
pub type PartialMessageCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Per-call options for `converse()`.
#[derive(Default)]
pub struct ConverseOptions {
    /// Session to continue. Falls back to the manager's current session.
    pub session_id: Option<String>,
    pub on_tool_use: Option<ToolUseCallback>,
    pub on_partial_message: Option<PartialMessageCallback>,
    /// Overrides the manager's default permission mode for this call.
    pub permission_mode: Option<PermissionMode>,
}

impl ConverseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn on_tool_use<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.on_tool_use = Some(Box::new(f));
        self
    }

    pub fn on_partial_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_partial_message = Some(Box::new(f));
        self
    }

    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = Some(mode);
        self
    }
}

impl std::fmt::Debug for ConverseOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverseOptions")
            .field("session_id", &self.session_id)
            .field("on_tool_use", &self.on_tool_use.is_some())
            .field("on_partial_message", &self.on_partial_message.is_some())
            .field("permission_mode", &self.permission_mode)
            .finish()
    }
}

/// Conversation state held by the manager. Every field, cost included, is
/// dropped by `clear_history`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Upstream session id; unset until the first turn reports one.
    pub session_id: Option<String>,
    /// Append-only until cleared.
    pub history: Vec<ConversationTurn>,
    /// Sum of the reported cost of every completed turn.
    pub total_cost_usd: f64,
    pub completed_turns: u32,
}

impl Session {
    fn reset(&mut self) {
        *self = Self::default();
    }
}
