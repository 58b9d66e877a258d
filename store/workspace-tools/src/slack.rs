//! Slack Web API tools.
//!
//! Slack answers most failures with HTTP 200 and `{"ok": false, "error": ...}`,
//! so the error code is mapped here as well as the status.

use async_trait::async_trait;
use scopegate::{Tool, ToolContext, ToolError, ToolResult};
use serde_json::{json, Value};
use tracing::debug;

use crate::http::{send_json, ApiClient};

pub const DEFAULT_BASE_URL: &str = "https://slack.com/api";

/// Error codes that mean the token no longer carries the needed grant.
const AUTH_ERRORS: &[&str] = &[
    "not_authed",
    "invalid_auth",
    "account_inactive",
    "token_revoked",
    "token_expired",
    "missing_scope",
    "no_permission",
];

fn check_ok(body: Value) -> Result<Value, ToolError> {
    if body.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(body);
    }
    let code = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error")
        .to_string();
    debug!(code = %code, "slack call failed");
    Err(match code.as_str() {
        c if AUTH_ERRORS.contains(&c) => ToolError::Unauthorized(code),
        "ratelimited" => ToolError::RateLimited { retry_after: None },
        "channel_not_found" | "not_in_channel" | "is_archived" | "msg_too_long" | "no_text" => {
            ToolError::InvalidArguments(code)
        }
        _ => ToolError::Failed(format!("slack error: {}", code)),
    })
}

/// `slack_post_message`: arguments `channel`, `text`, optional `thread_ts`.
#[derive(Debug, Clone)]
pub struct PostMessageTool {
    api: ApiClient,
}

impl PostMessageTool {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Tool for PostMessageTool {
    fn name(&self) -> &str {
        "slack_post_message"
    }

    fn description(&self) -> &str {
        "Post a message to a Slack channel"
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolResult, ToolError> {
        let channel = ctx.str_arg("channel")?;
        let text = ctx.str_arg("text")?;
        if text.trim().is_empty() {
            return Err(ToolError::InvalidArguments("text must not be empty".to_string()));
        }
        let mut payload = json!({ "channel": channel, "text": text });
        if let Some(thread_ts) = ctx.arguments.get("thread_ts").and_then(Value::as_str) {
            payload["thread_ts"] = json!(thread_ts);
        }

        ctx.progress(format!("Posting to {}", channel)).await;
        let request = self.api.post(&ctx, &["chat.postMessage"])?.json(&payload);
        let body = check_ok(send_json(request).await?)?;

        Ok(ToolResult::success_with_message(
            json!({
                "channel": body.get("channel").cloned().unwrap_or(Value::Null),
                "ts": body.get("ts").cloned().unwrap_or(Value::Null),
            }),
            format!("Message posted to {}", channel),
        ))
    }
}
