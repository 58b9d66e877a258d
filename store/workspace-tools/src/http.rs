//! Shared HTTP plumbing for provider APIs.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode, Url};
use scopegate::{ToolContext, ToolError};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const MAX_ERROR_BODY: usize = 512;

/// Client bound to one provider API base URL.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base URL extended by path segments, each percent-encoded.
    pub fn url(&self, segments: &[&str]) -> Result<Url, ToolError> {
        let invalid = || ToolError::Failed(format!("invalid API base URL '{}'", self.base_url));
        let mut url = Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn get(&self, ctx: &ToolContext, segments: &[&str]) -> Result<RequestBuilder, ToolError> {
        Ok(self.http.get(self.url(segments)?).bearer_auth(bearer(ctx)?))
    }

    pub fn post(&self, ctx: &ToolContext, segments: &[&str]) -> Result<RequestBuilder, ToolError> {
        Ok(self.http.post(self.url(segments)?).bearer_auth(bearer(ctx)?))
    }
}

fn bearer(ctx: &ToolContext) -> Result<&str, ToolError> {
    ctx.access_token()
        .ok_or_else(|| ToolError::Unauthorized(format!("{} ran without a provider token", ctx.tool)))
}

/// Send a request and decode a JSON body, mapping HTTP failures to [`ToolError`].
pub async fn send_json(request: RequestBuilder) -> Result<Value, ToolError> {
    let response = request
        .send()
        .await
        .map_err(|e| ToolError::Upstream {
            status: 0,
            message: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "provider request failed");
        return Err(status_error(status, &headers, &body));
    }

    response.json::<Value>().await.map_err(|e| ToolError::Upstream {
        status: status.as_u16(),
        message: format!("invalid JSON body: {}", e),
    })
}

pub fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> ToolError {
    let message = truncate(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ToolError::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => ToolError::RateLimited {
            retry_after: parse_retry_after(headers),
        },
        _ => ToolError::Upstream {
            status: status.as_u16(),
            message,
        },
    }
}

/// `Retry-After` in delta-seconds; HTTP dates are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
