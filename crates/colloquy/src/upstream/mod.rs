//! Upstream message sources.
//!
//! The adapter treats the LLM transport as an opaque, finite, non-restartable
//! stream of raw JSON messages. Implementations:
//!
//! - [`ProcessUpstream`]: spawns a stream-json agent CLI and reads its stdout.
//! - [`ScriptedUpstream`]: replays a fixed message list (tests, audit replay).

mod process;
mod scripted;

pub use process::{ProcessUpstream, ProcessUpstreamConfig};
pub use scripted::{ScriptedUpstream, replay_messages};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;

/// Stream of raw upstream messages.
pub type RawMessageStream = Pin<Box<dyn Stream<Item = Result<Value, UpstreamError>> + Send>>;

/// Errors raised by an upstream source. All of them are transport errors from
/// the adapter's point of view.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The transport could not be started.
    #[error("failed to start upstream: {0}")]
    Spawn(String),

    /// Reading from the transport failed.
    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport process exited unsuccessfully.
    #[error("upstream exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    /// The connection dropped mid-stream.
    #[error("upstream disconnected: {0}")]
    Disconnected(String),
}

/// How tool permission prompts are resolved upstream.
///
/// Passed explicitly with every request instead of being read from
/// process-global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Ask before every tool call (upstream default).
    #[default]
    Default,
    /// Auto-approve file edits.
    AcceptEdits,
    /// Auto-approve everything.
    BypassPermissions,
    /// Plan only, do not execute tools.
    Plan,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request to the upstream transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamRequest {
    pub prompt: String,
    /// Session to continue, if any. Context reconstruction is the upstream's job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    pub permission_mode: PermissionMode,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Open a message stream for one turn.
    async fn open(&self, request: UpstreamRequest) -> Result<RawMessageStream, UpstreamError>;

    /// Short identifier for logs.
    fn name(&self) -> &str;
}
