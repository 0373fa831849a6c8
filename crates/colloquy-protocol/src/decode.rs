//! Decoder from raw upstream messages to domain events.
//!
//! ## Rules
//!
//! 1. One raw message produces 0..N events, returned in content order.
//! 2. The decoder is pure: the same input always yields the same output.
//! 3. Nothing is an error. Unknown or malformed input becomes `RawPassthrough`.
//! 4. `result` messages become `TurnResult` and are never passed through.

use serde::Deserialize;
use serde_json::Value;

use crate::events::DomainEvent;
use crate::wire::{ChatMessage, Content, ContentBlock, ResultMessage, SystemMessage, UpstreamMessage};

/// Decode one raw upstream message.
pub fn decode(raw: &Value) -> Vec<DomainEvent> {
    let message = match UpstreamMessage::deserialize(raw) {
        Ok(message) => message,
        Err(_) => return vec![passthrough(raw)],
    };

    match message {
        UpstreamMessage::System(system) => decode_system(&system, raw),
        UpstreamMessage::Assistant(chat) => decode_assistant(&chat, raw),
        UpstreamMessage::User(chat) => decode_user(&chat, raw),
        UpstreamMessage::ToolUse(tool) => vec![DomainEvent::ToolUse {
            name: tool.name,
            input: tool.input,
            id: tool.id,
        }],
        UpstreamMessage::ToolResult(tool) => vec![DomainEvent::ToolResult {
            name: tool.name,
            tool_use_id: tool.tool_use_id,
            output: tool.content,
            is_error: tool.is_error,
        }],
        UpstreamMessage::Result(result) => vec![decode_result(&result)],
        UpstreamMessage::Unknown => vec![passthrough(raw)],
    }
}

/// Parse one JSONL line. Text that is not JSON is kept as a JSON string so it
/// still reaches the audit log and decodes to `RawPassthrough`.
pub fn parse_line(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}

/// Decode one JSONL line.
pub fn decode_line(line: &str) -> Vec<DomainEvent> {
    decode(&parse_line(line))
}

/// Wire discriminator of a raw message (`type`, or `type/subtype` for system
/// messages). Used for audit `messageType`.
pub fn message_type(raw: &Value) -> Option<String> {
    let ty = raw.get("type")?.as_str()?;
    match raw.get("subtype").and_then(Value::as_str) {
        Some(subtype) if ty == "system" => Some(format!("{ty}/{subtype}")),
        _ => Some(ty.to_string()),
    }
}

fn passthrough(raw: &Value) -> DomainEvent {
    DomainEvent::RawPassthrough {
        payload: raw.clone(),
    }
}

fn decode_system(system: &SystemMessage, raw: &Value) -> Vec<DomainEvent> {
    if system.is_init() {
        vec![DomainEvent::SessionInit {
            session_id: system.session_id.clone(),
            model: system.model.clone(),
        }]
    } else {
        vec![passthrough(raw)]
    }
}

fn decode_assistant(chat: &ChatMessage, raw: &Value) -> Vec<DomainEvent> {
    match chat.content() {
        Some(Content::Text(text)) => vec![DomainEvent::TextChunk { text: text.clone() }],
        Some(Content::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(DomainEvent::TextChunk { text: text.clone() }),
                ContentBlock::ToolUse { id, name, input } => Some(DomainEvent::ToolUse {
                    name: name.clone(),
                    input: input.clone(),
                    id: id.clone(),
                }),
                // Tool results only make sense on the user side.
                ContentBlock::ToolResult { .. }
                | ContentBlock::Thinking { .. }
                | ContentBlock::Unknown => None,
            })
            .collect(),
        None => vec![passthrough(raw)],
    }
}

fn decode_user(chat: &ChatMessage, raw: &Value) -> Vec<DomainEvent> {
    let Some(Content::Blocks(blocks)) = chat.content() else {
        return vec![passthrough(raw)];
    };

    let results: Vec<DomainEvent> = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                name,
                content,
                is_error,
            } => Some(DomainEvent::ToolResult {
                name: name.clone(),
                tool_use_id: tool_use_id.clone(),
                output: content.clone(),
                is_error: *is_error,
            }),
            _ => None,
        })
        .collect();

    if results.is_empty() {
        vec![passthrough(raw)]
    } else {
        results
    }
}

fn decode_result(result: &ResultMessage) -> DomainEvent {
    DomainEvent::TurnResult {
        text: result.text(),
        cost_usd: result.cost(),
        session_id: result.session_id.clone(),
        num_turns: result.num_turns,
        is_error: result.is_error(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_system_init() {
        let events = decode(&json!({
            "type": "system",
            "subtype": "init",
            "session_id": "s1",
            "model": "claude-sonnet-4-20250514",
            "tools": ["Read", "Write"]
        }));
        assert_eq!(
            events,
            vec![DomainEvent::SessionInit {
                session_id: Some("s1".to_string()),
                model: Some("claude-sonnet-4-20250514".to_string()),
            }]
        );
    }

    #[test]
    fn test_system_other_subtype_passes_through() {
        let raw = json!({"type": "system", "subtype": "compact_boundary"});
        let events = decode(&raw);
        assert_eq!(events, vec![DomainEvent::RawPassthrough { payload: raw }]);
    }

    #[test]
    fn test_assistant_string_content() {
        let events = decode(&json!({"type": "assistant", "message": {"content": "hi there"}}));
        assert_eq!(
            events,
            vec![DomainEvent::TextChunk {
                text: "hi there".to_string()
            }]
        );
    }

    #[test]
    fn test_assistant_block_order_preserved() {
        let events = decode(&json!({
            "type": "assistant",
            "message": {
                "content": [
                    {"type": "text", "text": "A"},
                    {"type": "tool_use", "id": "tu_x", "name": "X", "input": {"n": 1}},
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "B"},
                    {"type": "tool_use", "id": "tu_y", "name": "Y", "input": {}}
                ]
            }
        }));

        let kinds: Vec<String> = events
            .iter()
            .map(|e| match e {
                DomainEvent::TextChunk { text } => format!("text:{text}"),
                DomainEvent::ToolUse { name, .. } => format!("tool:{name}"),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(kinds, vec!["text:A", "tool:X", "text:B", "tool:Y"]);

        if let DomainEvent::ToolUse { id, input, .. } = &events[1] {
            assert_eq!(id.as_deref(), Some("tu_x"));
            assert_eq!(input, &json!({"n": 1}));
        }
    }

    #[test]
    fn test_legacy_top_level_content() {
        let events = decode(&json!({
            "type": "assistant",
            "content": [{"type": "text", "text": "old shape"}]
        }));
        assert_eq!(
            events,
            vec![DomainEvent::TextChunk {
                text: "old shape".to_string()
            }]
        );
    }

    #[test]
    fn test_top_level_tool_use() {
        let events = decode(&json!({
            "type": "tool_use",
            "name": "write_file",
            "input": {"path": "a.txt"}
        }));
        assert_eq!(
            events,
            vec![DomainEvent::ToolUse {
                name: "write_file".to_string(),
                input: json!({"path": "a.txt"}),
                id: None,
            }]
        );
    }

    #[test]
    fn test_user_tool_results() {
        let events = decode(&json!({
            "type": "user",
            "message": {
                "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "ok"},
                    {"type": "tool_result", "tool_use_id": "tu_2", "content": "boom", "is_error": true}
                ]
            }
        }));
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            DomainEvent::ToolResult {
                name: None,
                tool_use_id: Some("tu_1".to_string()),
                output: json!("ok"),
                is_error: false,
            }
        );
        assert!(matches!(events[1], DomainEvent::ToolResult { is_error: true, .. }));
    }

    #[test]
    fn test_user_text_passes_through() {
        let raw = json!({"type": "user", "message": {"content": "just text"}});
        assert!(matches!(
            decode(&raw).as_slice(),
            [DomainEvent::RawPassthrough { .. }]
        ));
    }

    #[test]
    fn test_result() {
        let events = decode(&json!({
            "type": "result",
            "subtype": "success",
            "result": "hi there",
            "total_cost_usd": 0.002,
            "session_id": "s1",
            "num_turns": 1,
            "is_error": false
        }));
        assert_eq!(
            events,
            vec![DomainEvent::TurnResult {
                text: "hi there".to_string(),
                cost_usd: 0.002,
                session_id: Some("s1".to_string()),
                num_turns: Some(1),
                is_error: false,
            }]
        );
        assert!(events[0].is_terminal());
    }

    #[test]
    fn test_error_result() {
        let events = decode(&json!({
            "type": "result",
            "subtype": "error_during_execution",
            "is_error": true
        }));
        assert!(matches!(
            events.as_slice(),
            [DomainEvent::TurnResult { is_error: true, .. }]
        ));
    }

    #[test]
    fn test_unknown_and_malformed_pass_through() {
        let unknown = json!({"type": "stream_event", "event": {"type": "delta"}});
        assert_eq!(
            decode(&unknown),
            vec![DomainEvent::RawPassthrough {
                payload: unknown.clone()
            }]
        );

        // Known type, wrong shape.
        let malformed = json!({"type": "tool_use", "input": {}});
        assert_eq!(
            decode(&malformed),
            vec![DomainEvent::RawPassthrough {
                payload: malformed.clone()
            }]
        );

        let no_type = json!([1, 2, 3]);
        assert!(matches!(
            decode(&no_type).as_slice(),
            [DomainEvent::RawPassthrough { .. }]
        ));
    }

    #[test]
    fn test_decode_line_non_json() {
        let events = decode_line("Warning: something on stdout");
        assert_eq!(
            events,
            vec![DomainEvent::RawPassthrough {
                payload: Value::String("Warning: something on stdout".to_string())
            }]
        );
    }

    #[test]
    fn test_decode_is_deterministic() {
        let raw = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "A"},
                {"type": "tool_use", "id": "t", "name": "Bash", "input": {"command": "ls"}}
            ]}
        });
        assert_eq!(decode(&raw), decode(&raw));
    }

    #[test]
    fn test_message_type() {
        assert_eq!(
            message_type(&json!({"type": "system", "subtype": "init"})).as_deref(),
            Some("system/init")
        );
        assert_eq!(
            message_type(&json!({"type": "result", "subtype": "success"})).as_deref(),
            Some("result")
        );
        assert_eq!(message_type(&json!("text")), None);
    }
}
