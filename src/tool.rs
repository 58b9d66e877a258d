use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::events::ToolEvent;
use crate::identity::AccessToken;
use crate::streaming::TurnWriter;

/// A capability the assistant can call on the user's behalf.
///
/// Which provider a tool talks to, and which scopes it needs, come from the
/// provider catalogue; tools only implement the call itself.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use scopegate::{Tool, ToolContext, ToolError, ToolResult};
///
/// struct ListEvents;
///
/// #[async_trait]
/// impl Tool for ListEvents {
///     fn name(&self) -> &str { "calendar_list_events" }
///
///     async fn execute(&self, ctx: ToolContext) -> Result<ToolResult, ToolError> {
///         let _token = ctx.access_token().ok_or_else(|| ToolError::Unauthorized("no token".into()))?;
///         ctx.progress("Fetching events").await;
///         Ok(ToolResult::success(serde_json::json!({ "events": [] })))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name as the assistant calls it (e.g. "slack_post_message")
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolResult, ToolError>;
}

/// Errors a tool reports back to the gate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    /// The provider rejected the token (revoked, expired, missing scope)
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    /// Worth retrying after a short wait.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Upstream { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Context passed to a single tool execution
pub struct ToolContext {
    pub user_id: String,
    pub call_id: String,
    pub tool: String,
    pub arguments: serde_json::Value,
    token: Option<AccessToken>,
    writer: Option<TurnWriter>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("user_id", &self.user_id)
            .field("call_id", &self.call_id)
            .field("tool", &self.tool)
            .field("arguments", &self.arguments)
            .field("token", &self.token.as_ref().map(|_| "<AccessToken>"))
            .finish()
    }
}

impl ToolContext {
    pub fn new(
        user_id: impl Into<String>,
        call_id: impl Into<String>,
        tool: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            call_id: call_id.into(),
            tool: tool.into(),
            arguments,
            token: None,
            writer: None,
        }
    }

    /// Attach the resolved provider token (builder pattern)
    pub fn with_token(mut self, token: AccessToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Attach the turn writer used for progress events (builder pattern)
    pub fn with_writer(mut self, writer: TurnWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn access_token(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.access_token.as_str())
    }

    /// Required string argument
    pub fn str_arg(&self, name: &str) -> Result<&str, ToolError> {
        self.arguments
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments(format!("missing string argument '{}'", name)))
    }

    /// Emit a `processing` event; a closed turn is ignored.
    pub async fn progress(&self, message: impl Into<String>) {
        if let Some(writer) = &self.writer {
            let event = ToolEvent::processing(&self.tool, &self.call_id, message);
            let _ = writer.tool_event(event).await;
        }
    }
}

/// Result returned from a tool execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub success: bool,

    pub output: serde_json::Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ToolResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            message: None,
        }
    }

    pub fn success_with_message(output: serde_json::Value, message: String) -> Self {
        Self {
            success: true,
            output,
            message: Some(message),
        }
    }

    pub fn failure(message: String) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            message: Some(message),
        }
    }
}
