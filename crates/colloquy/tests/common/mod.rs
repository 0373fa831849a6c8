//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use colloquy::protocol::AuditRecord;
use colloquy::{AuditLogger, ScriptedUpstream, SessionManager};
use serde_json::{Value, json};

pub fn init(session_id: &str) -> Value {
    json!({"type": "system", "subtype": "init", "session_id": session_id, "model": "sonnet"})
}

pub fn text(text: &str) -> Value {
    json!({"type": "assistant", "message": {"content": [{"type": "text", "text": text}]}})
}

pub fn tool_use(id: &str, name: &str, input: Value) -> Value {
    json!({
        "type": "assistant",
        "message": {"content": [{"type": "tool_use", "id": id, "name": name, "input": input}]}
    })
}

pub fn tool_result(id: &str, output: &str) -> Value {
    json!({
        "type": "user",
        "message": {"content": [{"type": "tool_result", "tool_use_id": id, "content": output}]}
    })
}

pub fn result(text: &str, cost: f64, session_id: &str) -> Value {
    json!({
        "type": "result",
        "subtype": "success",
        "result": text,
        "total_cost_usd": cost,
        "session_id": session_id,
        "num_turns": 1
    })
}

pub fn simple_turn(session_id: &str, reply: &str) -> Vec<Value> {
    vec![init(session_id), text(reply), result(reply, 0.001, session_id)]
}

/// Manager writing its audit log into `dir`.
pub async fn manager_with_audit(upstream: &ScriptedUpstream, dir: &Path) -> SessionManager {
    let audit = AuditLogger::open(dir, "test-audit").await.unwrap();
    SessionManager::new(Arc::new(upstream.clone()), audit)
}

pub fn manager(upstream: &ScriptedUpstream) -> SessionManager {
    SessionManager::new(Arc::new(upstream.clone()), AuditLogger::disabled())
}

pub async fn audit_records(manager: &SessionManager) -> Vec<AuditRecord> {
    manager.audit().flush().await;
    let path = manager.audit().path().unwrap();
    colloquy::audit::read_records(path).unwrap()
}
