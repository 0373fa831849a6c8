//! Drives one conversation turn from upstream open to final result.

use futures::StreamExt;
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};

use colloquy_protocol::{
    AuditEventType, ConversationTurn, ConverseEvent, DomainEvent, TurnResult, decode, message_type,
};

use super::{ConverseOptions, SessionManager};
use crate::aggregator::ResponseAggregator;
use crate::hooks::{HookContext, HookPhase, panic_message};
use crate::upstream::{RawMessageStream, UpstreamRequest};

const END_OF_STREAM: &str = "upstream ended before a result";

/// State of one in-flight turn. Dropping it before completion abandons the
/// turn: the upstream stream is released and a `turn_abandoned` record is
/// written.
pub(super) struct Turn<'a> {
    manager: &'a mut SessionManager,
    options: ConverseOptions,
    request: Option<UpstreamRequest>,
    upstream: Option<RawMessageStream>,
    aggregator: ResponseAggregator,
    /// Events ready to be yielded, in order.
    pending: VecDeque<ConverseEvent>,
    turn_id: String,
    raw_messages: usize,
    finished: bool,
}

impl<'a> Turn<'a> {
    pub(super) fn new(
        manager: &'a mut SessionManager,
        options: ConverseOptions,
        request: UpstreamRequest,
        aggregator: ResponseAggregator,
        turn_id: String,
    ) -> Self {
        Self {
            manager,
            options,
            request: Some(request),
            upstream: None,
            aggregator,
            pending: VecDeque::new(),
            turn_id,
            raw_messages: 0,
            finished: false,
        }
    }

    /// Next caller-visible event, or `None` once the turn is over.
    pub(super) async fn step(&mut self) -> Option<ConverseEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }
            self.advance().await;
        }
    }

    /// Pull one raw message from upstream and process it.
    async fn advance(&mut self) {
        if self.upstream.is_none() {
            let Some(request) = self.request.take() else {
                self.fail(END_OF_STREAM);
                return;
            };
            debug!(
                "turn {}: opening {} upstream",
                self.turn_id,
                self.manager.upstream.name()
            );
            match self.manager.upstream.open(request).await {
                Ok(stream) => self.upstream = Some(stream),
                Err(err) => {
                    self.fail(&err.to_string());
                    return;
                }
            }
        }

        let next = match self.upstream.as_mut() {
            Some(stream) => stream.next().await,
            None => None,
        };
        match next {
            Some(Ok(raw)) => self.handle_raw(raw).await,
            Some(Err(err)) => self.fail(&err.to_string()),
            None => self.fail(END_OF_STREAM),
        }
    }

    async fn handle_raw(&mut self, raw: Value) {
        self.raw_messages += 1;
        let events = decode(&raw);

        // Every record for this message is enqueued before any derived event
        // becomes visible to the caller.
        self.manager.audit.record(
            self.aggregator.session_id(),
            AuditEventType::RawMessage,
            message_type(&raw).as_deref(),
            raw,
            Some(self.metadata()),
        );
        for event in &events {
            self.manager.audit.record(
                self.aggregator.session_id(),
                AuditEventType::DecodedEvent,
                Some(event.kind()),
                serde_json::to_value(event).unwrap_or_default(),
                Some(self.metadata()),
            );
        }

        for event in events {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&mut self, event: DomainEvent) {
        match event {
            DomainEvent::ToolUse { name, input, id } => {
                {
                    let ctx = self.hook_context();
                    self.manager.hooks.run_pre(&ctx, &name, &input).await;
                    if let Some(callback) = &self.options.on_tool_use {
                        ctx.record_fired(HookPhase::Pre, "on_tool_use", &name, &input);
                        let outcome =
                            catch_unwind(AssertUnwindSafe(|| callback(name.as_str(), &input)));
                        if let Err(panic) = outcome {
                            let message =
                                format!("callback panicked: {}", panic_message(&*panic));
                            ctx.record_failure(HookPhase::Pre, "on_tool_use", &name, &message);
                        }
                    }
                }
                let update = self.aggregator.apply(DomainEvent::ToolUse { name, input, id });
                self.pending.extend(update);
            }
            event @ DomainEvent::ToolResult { .. } => {
                let update = self.aggregator.apply(event);
                if let Some(ConverseEvent::ToolResult { invocation }) = &update {
                    let output = invocation.output.clone().unwrap_or(Value::Null);
                    let ctx = self.hook_context();
                    self.manager
                        .hooks
                        .run_post(&ctx, &invocation.name, &output)
                        .await;
                }
                self.pending.extend(update);
            }
            event @ DomainEvent::TextChunk { .. } => {
                let update = self.aggregator.apply(event);
                if let (Some(ConverseEvent::Partial { text }), Some(callback)) =
                    (&update, &self.options.on_partial_message)
                    && let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(text.as_str())))
                {
                    let message = format!("callback panicked: {}", panic_message(&*panic));
                    self.hook_context()
                        .record_callback_failure("on_partial_message", &message);
                }
                self.pending.extend(update);
            }
            event @ DomainEvent::SessionInit { .. } => {
                let update = self.aggregator.apply(event);
                if update.is_some() {
                    self.manager.audit.record(
                        self.aggregator.session_id(),
                        AuditEventType::SessionInit,
                        Some("system/init"),
                        json!({
                            "sessionId": self.aggregator.session_id(),
                            "model": self.aggregator.model(),
                        }),
                        Some(self.metadata()),
                    );
                }
                self.pending.extend(update);
            }
            event @ DomainEvent::TurnResult { .. } => {
                if let Some(ConverseEvent::Complete(result)) = self.aggregator.apply(event) {
                    self.complete(result);
                }
            }
            event @ DomainEvent::RawPassthrough { .. } => {
                debug!("turn {}: forwarding unrecognized message", self.turn_id);
                let update = self.aggregator.apply(event);
                self.pending.extend(update);
            }
        }
    }

    /// Upstream failed before a result arrived.
    fn fail(&mut self, error: &str) {
        warn!("turn {}: transport error: {error}", self.turn_id);
        self.manager.audit.record(
            self.aggregator.session_id(),
            AuditEventType::TransportError,
            None,
            json!({ "error": error, "rawMessages": self.raw_messages }),
            Some(self.metadata()),
        );
        match self.aggregator.fail(error) {
            Some(result) => self.complete(result),
            None => self.finished = true,
        }
    }

    fn complete(&mut self, result: TurnResult) {
        self.finished = true;
        self.upstream = None;

        let session_id = result.session_id.clone();
        let metadata = self.metadata();
        let manager = &mut *self.manager;

        if !result.is_synthesized_error() {
            manager.session.history.push(ConversationTurn::assistant(
                result.response.clone(),
                result.tools_used.clone(),
            ));
            manager.audit.record(
                session_id.as_deref(),
                AuditEventType::HistoryAppend,
                None,
                json!({
                    "role": "assistant",
                    "text": result.response,
                    "toolCalls": result.tools_used.len(),
                    "historyLen": manager.session.history.len(),
                }),
                Some(metadata.clone()),
            );
        }
        manager.audit.record(
            session_id.as_deref(),
            AuditEventType::TurnResult,
            None,
            serde_json::to_value(&result).unwrap_or_default(),
            Some(metadata),
        );

        if session_id.is_some() {
            manager.session.session_id = session_id;
        }
        manager.session.total_cost_usd += result.cost_usd;
        manager.session.completed_turns += 1;

        info!(
            "turn {} finished (error={}, tools={}, cost=${:.4})",
            self.turn_id,
            result.is_error,
            result.tools_used.len(),
            result.cost_usd
        );
        self.pending.push_back(ConverseEvent::Complete(result));
    }

    fn hook_context(&self) -> HookContext<'_> {
        HookContext {
            audit: &self.manager.audit,
            session_id: self.aggregator.session_id(),
            turn_id: &self.turn_id,
        }
    }

    fn metadata(&self) -> Value {
        json!({ "turnId": self.turn_id })
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        info!(
            "turn {} abandoned after {} raw messages",
            self.turn_id, self.raw_messages
        );
        self.manager.audit.record(
            self.aggregator.session_id(),
            AuditEventType::TurnAbandoned,
            None,
            json!({
                "rawMessages": self.raw_messages,
                "partialText": self.aggregator.intermediate(),
            }),
            Some(self.metadata()),
        );
    }
}
