//! Tool executor with per-session user context injection.
//!
//! Reserved argument keys (`__user_id`, `__username`, `__user_email`,
//! `__current_date_time`) are always written from the executor's own
//! context, overriding any model-provided values. Handlers can trust
//! those keys.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use chorus_domain::tool::ToolCall;
use chorus_domain::{Error, Result};

use crate::builder::ToolOutput;
use crate::registry::ToolRegistry;

pub const KEY_USER_ID: &str = "__user_id";
pub const KEY_USERNAME: &str = "__username";
pub const KEY_USER_EMAIL: &str = "__user_email";
pub const KEY_CURRENT_DATE_TIME: &str = "__current_date_time";

/// Identity of the session owner, injected into every tool call.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub username: String,
    pub email: String,
}

/// Outcome of one tool execution.
#[derive(Debug)]
pub struct ToolOutcome {
    pub call: ToolCall,
    pub output: Option<ToolOutput>,
    pub error: Option<String>,
    pub duration: std::time::Duration,
}

impl ToolOutcome {
    /// The text that becomes the tool-role message: the handler's
    /// `content` if provided, else the JSON encoding of its data, else
    /// the error text.
    pub fn message_text(&self) -> String {
        if let Some(err) = &self.error {
            return format!("tool {} failed: {err}", self.call.tool_name);
        }
        match &self.output {
            Some(out) => match &out.content {
                Some(content) => content.clone(),
                None => serde_json::Value::Object(out.data.clone()).to_string(),
            },
            None => String::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Executes tool calls against a registry with the session's user
/// context injected. One executor per session.
#[derive(Default)]
pub struct ToolExecutor {
    user_ctx: Option<UserContext>,
}

impl ToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-session assignment. Must be called before `execute`.
    pub fn set_user_context(&mut self, ctx: UserContext) {
        self.user_ctx = Some(ctx);
    }

    pub fn user_context(&self) -> Option<&UserContext> {
        self.user_ctx.as_ref()
    }

    /// Run one tool call. Lookup failures and handler errors are
    /// reported inside the outcome so the reasoning round can hand
    /// them back to the model; only a missing user context is a hard
    /// error.
    pub async fn execute(
        &self,
        cancel: CancellationToken,
        registry: &ToolRegistry,
        call: ToolCall,
    ) -> Result<ToolOutcome> {
        let ctx = self
            .user_ctx
            .as_ref()
            .ok_or_else(|| Error::Validation("user context not set before execute".into()))?;

        let start = Instant::now();

        let Some(tool) = registry.find_by_name(&call.tool_name) else {
            return Ok(ToolOutcome {
                error: Some(format!("tool not found: {}", call.tool_name)),
                call,
                output: None,
                duration: start.elapsed(),
            });
        };

        // Clone the model-supplied arguments and overwrite the
        // reserved keys. Injection wins over anything the model sent.
        let mut args = call.arguments.clone();
        args.insert(KEY_USER_ID.into(), ctx.user_id.clone().into());
        args.insert(KEY_USERNAME.into(), ctx.username.clone().into());
        args.insert(KEY_USER_EMAIL.into(), ctx.email.clone().into());
        args.insert(
            KEY_CURRENT_DATE_TIME.into(),
            chrono::Utc::now().to_rfc3339().into(),
        );

        let result = (tool.handler)(cancel, args).await;
        let duration = start.elapsed();

        let outcome = match result {
            Ok(output) => ToolOutcome {
                call,
                output: Some(output),
                error: None,
                duration,
            },
            Err(e) => ToolOutcome {
                call,
                output: None,
                error: Some(e.to_string()),
                duration,
            },
        };

        tracing::debug!(
            tool = %outcome.call.tool_name,
            duration_ms = outcome.duration.as_millis() as u64,
            is_error = outcome.is_error(),
            "tool executed"
        );
        Ok(outcome)
    }
}
