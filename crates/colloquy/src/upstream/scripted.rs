//! Upstream that replays a fixed list of raw messages.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use colloquy_protocol::AuditEventType;

use super::{RawMessageStream, Upstream, UpstreamError, UpstreamRequest};
use crate::audit::read_records;

/// One scripted turn: messages to emit, then an optional failure.
#[derive(Debug, Clone, Default)]
struct Script {
    messages: Vec<Value>,
    fail_with: Option<String>,
}

/// Replays scripted turns in order, one per `open()`.
///
/// When the scripts run out, further opens fail with a spawn error. Every
/// request is recorded so tests can check what was sent upstream.
#[derive(Clone, Default)]
pub struct ScriptedUpstream {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    requests: Arc<Mutex<Vec<UpstreamRequest>>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a turn that emits `messages` and ends cleanly.
    pub fn with_turn(self, messages: Vec<Value>) -> Self {
        self.push(Script {
            messages,
            fail_with: None,
        });
        self
    }

    /// Queue a turn that emits `messages` and then fails mid-stream.
    pub fn with_failing_turn(self, messages: Vec<Value>, error: impl Into<String>) -> Self {
        self.push(Script {
            messages,
            fail_with: Some(error.into()),
        });
        self
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn push(&self, script: Script) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push_back(script);
        }
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn open(&self, request: UpstreamRequest) -> Result<RawMessageStream, UpstreamError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.pop_front())
            .ok_or_else(|| UpstreamError::Spawn("no scripted turn left".to_string()))?;

        let mut items: Vec<Result<Value, UpstreamError>> =
            script.messages.into_iter().map(Ok).collect();
        if let Some(error) = script.fail_with {
            items.push(Err(UpstreamError::Disconnected(error)));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Extract the raw upstream messages of an audit log, grouped into turns.
///
/// A turn ends at each raw `result` message; trailing messages without a
/// result form a final, unterminated turn.
pub fn replay_messages(path: &Path) -> Result<Vec<Vec<Value>>> {
    let mut turns = Vec::new();
    let mut current = Vec::new();

    for record in read_records(path)? {
        if record.event_type != AuditEventType::RawMessage {
            continue;
        }
        let is_result = record.data.get("type").and_then(Value::as_str) == Some("result");
        current.push(record.data);
        if is_result {
            turns.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        turns.push(current);
    }
    Ok(turns)
}
