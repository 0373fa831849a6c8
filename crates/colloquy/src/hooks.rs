//! Pre/post callbacks around tool invocations.
//!
//! Hooks run in registration order. A hook that fails or panics is recorded
//! as a `hook_error` audit record and the remaining hooks still run; tool
//! tracking never depends on hook success.

use async_trait::async_trait;
use futures::FutureExt;
use log::warn;
use serde_json::{Value, json};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use colloquy_protocol::AuditEventType;

use crate::audit::AuditLogger;

#[async_trait]
pub trait ToolHook: Send + Sync {
    /// Name used in audit records.
    fn name(&self) -> &str;

    /// Whether this hook has a callback for `phase`. Unhandled phases are
    /// neither run nor recorded.
    fn handles(&self, _phase: HookPhase) -> bool {
        true
    }

    /// Called with the tool name and input before the invocation is recorded.
    async fn before_tool(&self, _tool_name: &str, _input: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called with the tool name and output after the invocation is updated.
    async fn after_tool(&self, _tool_name: &str, _output: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

type HookFn = Box<dyn Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync>;

/// A synchronous closure registered as a pre- or post-tool hook.
pub struct FnHook {
    name: String,
    before: Option<HookFn>,
    after: Option<HookFn>,
}

impl FnHook {
    pub fn pre<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            before: Some(Box::new(f)),
            after: None,
        }
    }

    pub fn post<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            before: None,
            after: Some(Box::new(f)),
        }
    }
}

#[async_trait]
impl ToolHook for FnHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, phase: HookPhase) -> bool {
        match phase {
            HookPhase::Pre => self.before.is_some(),
            HookPhase::Post => self.after.is_some(),
        }
    }

    async fn before_tool(&self, tool_name: &str, input: &Value) -> anyhow::Result<()> {
        match &self.before {
            Some(f) => f(tool_name, input),
            None => Ok(()),
        }
    }

    async fn after_tool(&self, tool_name: &str, output: &Value) -> anyhow::Result<()> {
        match &self.after {
            Some(f) => f(tool_name, output),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    fn audit_type(self) -> AuditEventType {
        match self {
            Self::Pre => AuditEventType::HookPre,
            Self::Post => AuditEventType::HookPost,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }
}

/// Where hook activity is recorded.
pub struct HookContext<'a> {
    pub audit: &'a AuditLogger,
    pub session_id: Option<&'a str>,
    pub turn_id: &'a str,
}

impl HookContext<'_> {
    pub fn record_fired(&self, phase: HookPhase, hook: &str, tool_name: &str, payload: &Value) {
        self.audit.record(
            self.session_id,
            phase.audit_type(),
            Some(tool_name),
            json!({ "hook": hook, "tool": tool_name, "payload": payload }),
            Some(json!({ "turnId": self.turn_id })),
        );
    }

    pub fn record_failure(&self, phase: HookPhase, hook: &str, tool_name: &str, error: &str) {
        warn!("{} hook '{hook}' failed for tool {tool_name}: {error}", phase.as_str());
        self.audit.record(
            self.session_id,
            AuditEventType::HookError,
            Some(tool_name),
            json!({ "hook": hook, "phase": phase.as_str(), "tool": tool_name, "error": error }),
            Some(json!({ "turnId": self.turn_id })),
        );
    }

    /// A caller callback that is not tied to a tool, such as the partial
    /// message callback, failed.
    pub fn record_callback_failure(&self, callback: &str, error: &str) {
        warn!("callback '{callback}' failed: {error}");
        self.audit.record(
            self.session_id,
            AuditEventType::HookError,
            None,
            json!({ "hook": callback, "phase": "partial", "error": error }),
            Some(json!({ "turnId": self.turn_id })),
        );
    }
}

/// Failures collected during one pipeline run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HookReport {
    pub fired: usize,
    pub failures: Vec<(String, String)>,
}

impl HookReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct HookPipeline {
    hooks: Vec<Arc<dyn ToolHook>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: impl ToolHook + 'static) {
        self.hooks.push(Arc::new(hook));
    }

    pub fn register_arc(&mut self, hook: Arc<dyn ToolHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every pre-hook for a tool-use event.
    pub async fn run_pre(&self, ctx: &HookContext<'_>, tool_name: &str, input: &Value) -> HookReport {
        self.run(ctx, HookPhase::Pre, tool_name, input).await
    }

    /// Run every post-hook for a matched tool result.
    pub async fn run_post(
        &self,
        ctx: &HookContext<'_>,
        tool_name: &str,
        output: &Value,
    ) -> HookReport {
        self.run(ctx, HookPhase::Post, tool_name, output).await
    }

    async fn run(
        &self,
        ctx: &HookContext<'_>,
        phase: HookPhase,
        tool_name: &str,
        payload: &Value,
    ) -> HookReport {
        let mut report = HookReport::default();
        for hook in &self.hooks {
            if !hook.handles(phase) {
                continue;
            }
            ctx.record_fired(phase, hook.name(), tool_name, payload);
            let call = match phase {
                HookPhase::Pre => hook.before_tool(tool_name, payload),
                HookPhase::Post => hook.after_tool(tool_name, payload),
            };
            let outcome = AssertUnwindSafe(call).catch_unwind().await;
            report.fired += 1;
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(panic) => format!("hook panicked: {}", panic_message(&*panic)),
            };
            ctx.record_failure(phase, hook.name(), tool_name, &message);
            report.failures.push((hook.name().to_string(), message));
        }
        report
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
