//! Protocol types for the colloquy conversational session adapter.
//!
//! This crate defines every data shape that crosses a boundary of the adapter:
//!
//! ```text
//! Upstream agent --[raw JSONL messages]--> decode() --[DomainEvent]--> adapter
//!                                                                        |
//!                                          caller <--[ConverseEvent]-----+
//!                                                                        |
//!                                      audit file <--[AuditRecord]-------+
//! ```
//!
//! ## Design Principles
//!
//! 1. **Raw messages are untrusted.** Anything the decoder does not recognize
//!    becomes a `RawPassthrough` event rather than an error.
//! 2. **Domain events are a closed set.** Every consumer matches exhaustively.
//! 3. **Audit records are the on-disk contract.** Field names are camelCase and
//!    stable; replay tooling depends on them.
//! 4. **Decoding is stateless.** Cross-message state (tool matching, text
//!    aggregation) lives in the adapter, not here.

pub mod audit;
pub mod decode;
pub mod events;
pub mod messages;
pub mod wire;

pub use audit::{AuditEventType, AuditRecord};
pub use decode::{decode, decode_line, message_type, parse_line};
pub use events::{ConverseEvent, DomainEvent};
pub use messages::{
    ConversationTurn, ERROR_PREFIX, NO_RESPONSE_PLACEHOLDER, Role, ToolInvocation, TurnResult,
};
