//! Folds decoded events into the running state of one conversation turn.
//!
//! ## State machine
//!
//! ```text
//! AwaitingInit --(init | text | tool use)--> Streaming --(result ok)--> Terminated
//!       |                                        |
//!       +--------(result error | upstream failure)-----------------> Error
//! ```
//!
//! Init is not required before content: degraded upstreams sometimes send it
//! late or not at all. Events arriving after a terminal state are ignored.

use log::{debug, warn};
use serde_json::Value;
use std::time::Instant;

use colloquy_protocol::{
    ConverseEvent, DomainEvent, ERROR_PREFIX, NO_RESPONSE_PLACEHOLDER, ToolInvocation, TurnResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    AwaitingInit,
    Streaming,
    Terminated,
    Error,
}

impl AggregatorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }
}

/// Monotonic milliseconds since a fixed origin.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ResponseAggregator {
    state: AggregatorState,
    clock: MonotonicClock,
    session_id: Option<String>,
    model: Option<String>,
    /// Latest assistant text.
    current_text: Option<String>,
    /// Every non-empty assistant text, in arrival order.
    intermediate: Vec<String>,
    tools: Vec<ToolInvocation>,
    result: Option<TurnResult>,
}

impl ResponseAggregator {
    /// `session_id` is the id known before the turn started, if any.
    pub fn new(clock: MonotonicClock, session_id: Option<String>) -> Self {
        Self {
            state: AggregatorState::AwaitingInit,
            clock,
            session_id,
            model: None,
            current_text: None,
            intermediate: Vec::new(),
            tools: Vec::new(),
            result: None,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn current_text(&self) -> Option<&str> {
        self.current_text.as_deref()
    }

    pub fn intermediate(&self) -> &[String] {
        &self.intermediate
    }

    pub fn tools(&self) -> &[ToolInvocation] {
        &self.tools
    }

    /// The final result, once a terminal state was reached.
    pub fn result(&self) -> Option<&TurnResult> {
        self.result.as_ref()
    }

    /// Apply one event; returns the caller-visible update it produced, if any.
    pub fn apply(&mut self, event: DomainEvent) -> Option<ConverseEvent> {
        if self.state.is_terminal() {
            debug!("ignoring {} after turn ended", event.kind());
            return None;
        }

        match event {
            DomainEvent::SessionInit { session_id, model } => {
                self.start_streaming();
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                if model.is_some() {
                    self.model = model;
                }
                Some(ConverseEvent::SessionStarted {
                    session_id: self.session_id.clone(),
                    model: self.model.clone(),
                })
            }
            DomainEvent::TextChunk { text } => {
                self.start_streaming();
                if text.trim().is_empty() {
                    return None;
                }
                self.current_text = Some(text.clone());
                self.intermediate.push(text.clone());
                Some(ConverseEvent::Partial { text })
            }
            DomainEvent::ToolUse { name, input, id } => {
                self.start_streaming();
                let invocation = ToolInvocation {
                    id,
                    name,
                    input,
                    output: None,
                    is_error: false,
                    requested_at_ms: self.clock.now_ms(),
                    completed_at_ms: None,
                };
                self.tools.push(invocation.clone());
                Some(ConverseEvent::ToolUse { invocation })
            }
            DomainEvent::ToolResult {
                name,
                tool_use_id,
                output,
                is_error,
            } => self
                .complete_tool(name, tool_use_id.as_deref(), output, is_error)
                .map(|invocation| ConverseEvent::ToolResult { invocation }),
            DomainEvent::TurnResult {
                text,
                cost_usd,
                session_id,
                num_turns,
                is_error,
            } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                let result = if is_error {
                    let message = if text.trim().is_empty() {
                        "upstream reported an error".to_string()
                    } else {
                        text
                    };
                    self.finish_error(&message, cost_usd, num_turns)
                } else {
                    self.finish_success(&text, cost_usd, num_turns)
                };
                Some(ConverseEvent::Complete(result))
            }
            DomainEvent::RawPassthrough { payload } => Some(ConverseEvent::Passthrough { payload }),
        }
    }

    /// The upstream failed before a result arrived. Produces a best-effort
    /// result from whatever was collected.
    pub fn fail(&mut self, error: &str) -> Option<TurnResult> {
        if self.state.is_terminal() {
            return None;
        }
        Some(self.finish_error(error, 0.0, None))
    }

    fn start_streaming(&mut self) {
        if self.state == AggregatorState::AwaitingInit {
            self.state = AggregatorState::Streaming;
        }
    }

    /// Attach a result to its invocation.
    ///
    /// The id (when known) only resolves the tool name; the output then goes
    /// to the oldest invocation of that name still lacking one. Concurrent
    /// same-named calls can therefore be crossed if upstream answers them out
    /// of order.
    fn complete_tool(
        &mut self,
        name: Option<String>,
        tool_use_id: Option<&str>,
        output: Value,
        is_error: bool,
    ) -> Option<ToolInvocation> {
        let resolved = tool_use_id
            .and_then(|id| {
                self.tools
                    .iter()
                    .find(|t| t.id.as_deref() == Some(id))
                    .map(|t| t.name.clone())
            })
            .or(name);

        let index = match &resolved {
            Some(name) => self
                .tools
                .iter()
                .position(|t| &t.name == name && t.is_pending()),
            None => self.tools.iter().position(ToolInvocation::is_pending),
        };

        let Some(index) = index else {
            warn!(
                "tool result (id={tool_use_id:?}, name={resolved:?}) has no pending invocation"
            );
            return None;
        };

        let completed_at = self.clock.now_ms();
        let invocation = &mut self.tools[index];
        invocation.output = Some(output);
        invocation.is_error = is_error;
        invocation.completed_at_ms = Some(completed_at);
        Some(invocation.clone())
    }

    fn finish_success(&mut self, text: &str, cost_usd: f64, num_turns: Option<u32>) -> TurnResult {
        let response = compose_response(&self.intermediate, text);
        self.state = AggregatorState::Terminated;
        self.store(TurnResult {
            response,
            session_id: self.session_id.clone(),
            cost_usd,
            tools_used: self.tools.clone(),
            is_error: false,
            num_turns,
            error: None,
        })
    }

    fn finish_error(&mut self, error: &str, cost_usd: f64, num_turns: Option<u32>) -> TurnResult {
        let response = if self.intermediate.is_empty() {
            format!("{ERROR_PREFIX} {error}")
        } else {
            self.intermediate.join("\n\n")
        };
        self.state = AggregatorState::Error;
        self.store(TurnResult {
            response,
            session_id: self.session_id.clone(),
            cost_usd,
            tools_used: self.tools.clone(),
            is_error: true,
            num_turns,
            error: Some(error.to_string()),
        })
    }

    fn store(&mut self, result: TurnResult) -> TurnResult {
        self.result = Some(result.clone());
        result
    }
}

/// Intermediate messages joined by blank lines, plus the final text unless it
/// merely echoes the last intermediate message.
pub fn compose_response(intermediate: &[String], final_text: &str) -> String {
    let final_text = final_text.trim();
    let mut parts: Vec<&str> = intermediate.iter().map(String::as_str).collect();
    let echoes_last = parts
        .last()
        .is_some_and(|last| last.trim() == final_text);
    if !final_text.is_empty() && !echoes_last {
        parts.push(final_text);
    }

    if parts.is_empty() {
        NO_RESPONSE_PLACEHOLDER.to_string()
    } else {
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn aggregator() -> ResponseAggregator {
        ResponseAggregator::new(MonotonicClock::new(), None)
    }

    fn text(t: &str) -> DomainEvent {
        DomainEvent::TextChunk {
            text: t.to_string(),
        }
    }

    fn tool_use(name: &str, id: Option<&str>) -> DomainEvent {
        DomainEvent::ToolUse {
            name: name.to_string(),
            input: json!({"tool": name}),
            id: id.map(str::to_string),
        }
    }

    fn tool_result(id: Option<&str>, output: &str) -> DomainEvent {
        DomainEvent::ToolResult {
            name: None,
            tool_use_id: id.map(str::to_string),
            output: json!(output),
            is_error: false,
        }
    }

    fn result(t: &str, cost: f64, session: Option<&str>) -> DomainEvent {
        DomainEvent::TurnResult {
            text: t.to_string(),
            cost_usd: cost,
            session_id: session.map(str::to_string),
            num_turns: Some(1),
            is_error: false,
        }
    }

    #[test]
    fn test_simple_turn() {
        let mut agg = aggregator();
        assert_eq!(agg.state(), AggregatorState::AwaitingInit);

        agg.apply(DomainEvent::SessionInit {
            session_id: Some("s1".to_string()),
            model: Some("sonnet".to_string()),
        });
        assert_eq!(agg.state(), AggregatorState::Streaming);

        let update = agg.apply(text("hi there"));
        assert_eq!(
            update,
            Some(ConverseEvent::Partial {
                text: "hi there".to_string()
            })
        );

        let Some(ConverseEvent::Complete(result)) = agg.apply(result("hi there", 0.002, Some("s1")))
        else {
            panic!("expected completion");
        };
        assert_eq!(result.response, "hi there");
        assert_eq!(result.session_id.as_deref(), Some("s1"));
        assert!((result.cost_usd - 0.002).abs() < 1e-12);
        assert!(result.tools_used.is_empty());
        assert!(!result.is_error);
        assert_eq!(agg.state(), AggregatorState::Terminated);
    }

    #[test]
    fn test_content_before_init_is_tolerated() {
        let mut agg = aggregator();
        agg.apply(text("early"));
        assert_eq!(agg.state(), AggregatorState::Streaming);
        agg.apply(DomainEvent::SessionInit {
            session_id: Some("late".to_string()),
            model: None,
        });
        assert_eq!(agg.session_id(), Some("late"));
    }

    #[test]
    fn test_intermediate_messages_joined_and_final_echo_dropped() {
        let mut agg = aggregator();
        agg.apply(text("Let me check."));
        agg.apply(text("All done."));
        let Some(ConverseEvent::Complete(result)) = agg.apply(result("All done.", 0.0, None)) else {
            panic!("expected completion");
        };
        assert_eq!(result.response, "Let me check.\n\nAll done.");
    }

    #[test]
    fn test_final_text_appended_when_different() {
        let mut agg = aggregator();
        agg.apply(text("Working on it."));
        let Some(ConverseEvent::Complete(result)) = agg.apply(result("Summary.", 0.0, None)) else {
            panic!("expected completion");
        };
        assert_eq!(result.response, "Working on it.\n\nSummary.");
    }

    #[test]
    fn test_final_text_only() {
        let mut agg = aggregator();
        let Some(ConverseEvent::Complete(result)) = agg.apply(result("only final", 0.0, None))
        else {
            panic!("expected completion");
        };
        assert_eq!(result.response, "only final");
    }

    #[test]
    fn test_empty_turn_uses_placeholder() {
        let mut agg = aggregator();
        agg.apply(text("   "));
        let Some(ConverseEvent::Complete(result)) = agg.apply(result("", 0.0, None)) else {
            panic!("expected completion");
        };
        assert_eq!(result.response, NO_RESPONSE_PLACEHOLDER);
        assert!(result.is_placeholder());
        assert!(!result.is_error);
    }

    #[test]
    fn test_session_id_falls_back_to_init() {
        let mut agg = aggregator();
        agg.apply(DomainEvent::SessionInit {
            session_id: Some("from-init".to_string()),
            model: None,
        });
        agg.apply(result("x", 0.0, None));
        assert_eq!(agg.result().unwrap().session_id.as_deref(), Some("from-init"));
    }

    #[test]
    fn test_prior_session_id_kept() {
        let mut agg = ResponseAggregator::new(MonotonicClock::new(), Some("prior".to_string()));
        agg.apply(result("x", 0.0, None));
        assert_eq!(agg.result().unwrap().session_id.as_deref(), Some("prior"));
    }

    #[test]
    fn test_tool_result_matches_by_id_then_fifo_by_name() {
        let mut agg = aggregator();
        agg.apply(tool_use("Read", Some("t1")));
        agg.apply(tool_use("Bash", Some("t2")));
        agg.apply(tool_use("Read", Some("t3")));

        // Result for t3 resolves to name "Read" and lands on the first pending Read.
        let Some(ConverseEvent::ToolResult { invocation }) = agg.apply(tool_result(Some("t3"), "r"))
        else {
            panic!("expected tool result");
        };
        assert_eq!(invocation.id.as_deref(), Some("t1"));
        assert_eq!(invocation.output, Some(json!("r")));

        agg.apply(tool_result(Some("t2"), "b"));
        agg.apply(tool_result(Some("t1"), "r2"));

        let tools = agg.tools();
        assert_eq!(tools[0].output, Some(json!("r")));
        assert_eq!(tools[1].output, Some(json!("b")));
        assert_eq!(tools[2].output, Some(json!("r2")));
        assert!(tools.iter().all(|t| t.completed_at_ms.is_some()));
    }

    #[test]
    fn test_tool_result_without_id_uses_oldest_pending() {
        let mut agg = aggregator();
        agg.apply(tool_use("write_file", None));
        let update = agg.apply(tool_result(None, "ok"));
        assert!(matches!(update, Some(ConverseEvent::ToolResult { .. })));
        assert_eq!(agg.tools()[0].output, Some(json!("ok")));
    }

    #[test]
    fn test_unmatched_tool_result_is_dropped() {
        let mut agg = aggregator();
        assert_eq!(agg.apply(tool_result(Some("ghost"), "x")), None);
        assert!(agg.tools().is_empty());
    }

    #[test]
    fn test_failure_keeps_partial_text() {
        let mut agg = aggregator();
        agg.apply(text("first"));
        agg.apply(text("second"));
        let result = agg.fail("connection reset").unwrap();
        assert_eq!(result.response, "first\n\nsecond");
        assert!(result.is_error);
        assert_eq!(result.error.as_deref(), Some("connection reset"));
        assert_eq!(result.cost_usd, 0.0);
        assert_eq!(agg.state(), AggregatorState::Error);
    }

    #[test]
    fn test_failure_without_text_is_prefixed() {
        let mut agg = aggregator();
        let result = agg.fail("connection reset").unwrap();
        assert_eq!(result.response, "[error] connection reset");
        assert!(result.is_synthesized_error());
    }

    #[test]
    fn test_error_result_keeps_partial_text() {
        let mut agg = aggregator();
        agg.apply(text("partial"));
        let Some(ConverseEvent::Complete(result)) = agg.apply(DomainEvent::TurnResult {
            text: String::new(),
            cost_usd: 0.01,
            session_id: Some("s9".to_string()),
            num_turns: Some(4),
            is_error: true,
        }) else {
            panic!("expected completion");
        };
        assert!(result.is_error);
        assert_eq!(result.response, "partial");
        assert_eq!(result.error.as_deref(), Some("upstream reported an error"));
        assert_eq!(result.session_id.as_deref(), Some("s9"));
        assert_eq!(agg.state(), AggregatorState::Error);
    }

    #[test]
    fn test_events_after_terminal_are_ignored() {
        let mut agg = aggregator();
        agg.apply(result("done", 0.0, None));
        assert_eq!(agg.apply(text("late")), None);
        assert!(agg.fail("late failure").is_none());
        assert_eq!(agg.result().unwrap().response, "done");
    }

    #[test]
    fn test_passthrough_forwarded() {
        let mut agg = aggregator();
        let payload = json!({"type": "stream_event"});
        assert_eq!(
            agg.apply(DomainEvent::RawPassthrough {
                payload: payload.clone()
            }),
            Some(ConverseEvent::Passthrough { payload })
        );
        assert_eq!(agg.state(), AggregatorState::AwaitingInit);
    }
}
