//! Audit record format.
//!
//! One newline-delimited JSON object per record. The field names below are a
//! versioned external interface: replay and debugging tools read them.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Sink opened.
    AdapterStart,
    /// Verbatim upstream message.
    RawMessage,
    /// Event derived from a raw message by the decoder.
    DecodedEvent,
    /// Session id became known.
    SessionInit,
    /// A turn was appended to the history.
    HistoryAppend,
    /// A pre-tool hook fired.
    HookPre,
    /// A post-tool hook fired.
    HookPost,
    /// A hook failed.
    HookError,
    /// The final result of a turn.
    TurnResult,
    /// Upstream failed to open or failed mid-stream.
    TransportError,
    /// The caller stopped consuming a turn before it finished.
    TurnAbandoned,
    /// History was cleared.
    HistoryCleared,
    /// Sink closed.
    AdapterClose,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdapterStart => "adapter_start",
            Self::RawMessage => "raw_message",
            Self::DecodedEvent => "decoded_event",
            Self::SessionInit => "session_init",
            Self::HistoryAppend => "history_append",
            Self::HookPre => "hook_pre",
            Self::HookPost => "hook_post",
            Self::HookError => "hook_error",
            Self::TurnResult => "turn_result",
            Self::TransportError => "transport_error",
            Self::TurnAbandoned => "turn_abandoned",
            Self::HistoryCleared => "history_cleared",
            Self::AdapterClose => "adapter_close",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// RFC 3339, millisecond precision, UTC.
    pub timestamp: String,
    pub session_id: Option<String>,
    pub event_type: AuditEventType,
    pub message_type: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl AuditRecord {
    pub fn new(
        session_id: Option<String>,
        event_type: AuditEventType,
        message_type: Option<String>,
        data: Value,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            session_id,
            event_type,
            message_type,
            data,
            metadata: metadata.unwrap_or(Value::Object(Default::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_field_names() {
        let record = AuditRecord::new(
            Some("s1".to_string()),
            AuditEventType::RawMessage,
            Some("assistant".to_string()),
            json!({"type": "assistant"}),
            None,
        );
        let value = serde_json::to_value(&record).unwrap();
        let obj = value.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["data", "eventType", "messageType", "metadata", "sessionId", "timestamp"]
        );
        assert_eq!(value["eventType"], "raw_message");
        assert_eq!(value["metadata"], json!({}));
        assert!(record.timestamp.ends_with('Z'));
    }

    #[test]
    fn test_event_type_str_matches_serde() {
        for ty in [
            AuditEventType::HookPre,
            AuditEventType::TurnAbandoned,
            AuditEventType::HistoryCleared,
        ] {
            assert_eq!(serde_json::to_value(ty).unwrap(), json!(ty.as_str()));
        }
    }
}
