use futures::StreamExt;
use futures::stream::BoxStream;
use log::info;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use colloquy_protocol::{AuditEventType, ConversationTurn, ConverseEvent, TurnResult};

use super::turn::Turn;
use super::{ConverseOptions, Session, SessionError};
use crate::aggregator::{MonotonicClock, ResponseAggregator};
use crate::audit::AuditLogger;
use crate::hooks::{HookPipeline, ToolHook};
use crate::upstream::{PermissionMode, Upstream, UpstreamRequest};

/// Owns one conversation with an upstream agent.
///
/// The turn stream returned by [`converse`](Self::converse) borrows the
/// manager mutably, so turns never overlap.
pub struct SessionManager {
    pub(super) upstream: Arc<dyn Upstream>,
    pub(super) hooks: HookPipeline,
    pub(super) audit: AuditLogger,
    pub(super) session: Session,
    clock: MonotonicClock,
    permission_mode: PermissionMode,
}

impl SessionManager {
    pub fn new(upstream: Arc<dyn Upstream>, audit: AuditLogger) -> Self {
        Self {
            upstream,
            hooks: HookPipeline::new(),
            audit,
            session: Session::default(),
            clock: MonotonicClock::new(),
            permission_mode: PermissionMode::default(),
        }
    }

    /// Permission mode used when a call does not set one.
    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn with_hooks(mut self, hooks: HookPipeline) -> Self {
        self.hooks = hooks;
        self
    }

    /// Start from a known upstream session instead of a fresh one.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session.session_id = Some(session_id.into());
        self
    }

    pub fn register_hook(&mut self, hook: impl ToolHook + 'static) {
        self.hooks.register(hook);
    }

    /// Send one user message and stream the turn.
    ///
    /// The user turn is appended to the history before anything is sent
    /// upstream. The stream yields incremental updates and ends with exactly
    /// one [`ConverseEvent::Complete`]; upstream failures are folded into that
    /// result instead of being returned as errors.
    pub fn converse(
        &mut self,
        message: &str,
        options: ConverseOptions,
    ) -> Result<BoxStream<'_, ConverseEvent>, SessionError> {
        if message.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let turn_id = Uuid::new_v4().to_string();
        let resume_session_id = options
            .session_id
            .clone()
            .or_else(|| self.session.session_id.clone());
        let request = UpstreamRequest {
            prompt: message.to_string(),
            resume_session_id: resume_session_id.clone(),
            permission_mode: options.permission_mode.unwrap_or(self.permission_mode),
        };

        self.session.history.push(ConversationTurn::user(message));
        self.audit.record(
            resume_session_id.as_deref(),
            AuditEventType::HistoryAppend,
            None,
            json!({
                "role": "user",
                "text": message,
                "historyLen": self.session.history.len(),
                "request": request,
            }),
            Some(json!({ "turnId": turn_id })),
        );
        info!(
            "turn {turn_id} started (session={:?}, mode={})",
            resume_session_id, request.permission_mode
        );

        let aggregator = ResponseAggregator::new(self.clock, resume_session_id);
        let turn = Turn::new(self, options, request, aggregator, turn_id);

        Ok(futures::stream::unfold(turn, |mut turn| async move {
            let event = turn.step().await?;
            Some((event, turn))
        })
        .boxed())
    }

    /// Run a turn to completion and return its result.
    pub async fn converse_collect(
        &mut self,
        message: &str,
        options: ConverseOptions,
    ) -> Result<TurnResult, SessionError> {
        let mut stream = self.converse(message, options)?;
        while let Some(event) = stream.next().await {
            if let ConverseEvent::Complete(result) = event {
                return Ok(result);
            }
        }
        Err(SessionError::NoResult)
    }

    /// Forget the history and the upstream session. The audit log keeps
    /// everything.
    pub fn clear_history(&mut self) {
        let cleared = self.session.history.len();
        let previous = self.session.session_id.clone();
        let cost = self.session.total_cost_usd;
        let turns = self.session.completed_turns;
        self.session.reset();
        self.audit.record(
            previous.as_deref(),
            AuditEventType::HistoryCleared,
            None,
            json!({
                "clearedTurns": cleared,
                "completedTurns": turns,
                "totalCostUsd": cost,
            }),
            None,
        );
        info!("history cleared ({cleared} turns)");
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.session.history
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.session_id.as_deref()
    }

    pub fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Write the closing record and wait for the audit log to be flushed.
    pub async fn close(&self) {
        self.audit.close().await;
    }
}
