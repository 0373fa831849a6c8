//! Colloquy: a conversational session adapter for streaming, tool-using LLM
//! agents.
//!
//! Raw upstream messages are decoded into domain events, tool calls are
//! wrapped by a hook pipeline, events are folded into a per-turn result and
//! every step is written to an append-only audit log.

pub mod aggregator;
pub mod audit;
pub mod config;
pub mod hooks;
pub mod session;
pub mod upstream;

pub use colloquy_protocol as protocol;

pub use aggregator::{AggregatorState, ResponseAggregator};
pub use audit::AuditLogger;
pub use hooks::{FnHook, HookPhase, HookPipeline, ToolHook};
pub use session::{ConverseOptions, Session, SessionError, SessionManager};
pub use upstream::{
    PermissionMode, ProcessUpstream, ProcessUpstreamConfig, ScriptedUpstream, Upstream,
    UpstreamError, UpstreamRequest,
};
