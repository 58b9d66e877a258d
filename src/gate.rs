//! # Tool Execution Gate
//!
//! Every tool call goes through [`ToolExecutionGate::execute`]. The gate
//! checks the catalogue's required scopes against the user's connection and
//! either runs the tool with a resolved token or returns a
//! [`ConnectionRequired`] signal. Both are normal outcomes; only genuine
//! faults (unknown tool, identity broker down) are errors.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::GateConfig;
use crate::directive::{ConnectionRequired, RequiredReason};
use crate::error::{GateError, Result};
use crate::events::ToolEvent;
use crate::identity::{AccessToken, Identity, IdentityError};
use crate::scopes::{ScopeRegistry, ScopeSet};
use crate::store::ConnectionStore;
use crate::streaming::TurnWriter;
use crate::tool::{Tool, ToolContext, ToolError, ToolResult};

/// Bounded retry policy for transient downstream failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Upper bound on total attempts, including the first call.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, err: &ToolError, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts && err.is_transient()
    }

    /// Exponential backoff, overridden by a provider's retry-after hint.
    pub fn delay_for(&self, attempt: u32, err: &ToolError) -> Duration {
        if let Some(hint) = err.retry_after() {
            return hint.clamp(Duration::from_millis(1), Duration::from_secs(300));
        }
        let pow = 2u32.saturating_pow(attempt);
        let millis = self
            .initial_backoff
            .as_millis()
            .saturating_mul(pow as u128)
            .min(self.max_backoff.as_millis());
        Duration::from_millis(millis as u64)
    }
}

/// One tool call requested by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub tool: String,
    pub call_id: String,
    pub arguments: serde_json::Value,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, arguments: serde_json::Value) -> Self {
        let call_id = format!("call_{:016x}", rand::thread_rng().gen::<u64>());
        Self::with_call_id(tool, call_id, arguments)
    }

    pub fn with_call_id(
        tool: impl Into<String>,
        call_id: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            tool: tool.into(),
            call_id: call_id.into(),
            arguments,
        }
    }
}

/// Result of a gated tool call: exactly one of the two branches.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Completed(ToolResult),
    ConnectionRequired(ConnectionRequired),
}

impl ToolOutcome {
    pub fn is_connection_required(&self) -> bool {
        matches!(self, Self::ConnectionRequired(_))
    }

    pub fn result(&self) -> Option<&ToolResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::ConnectionRequired(_) => None,
        }
    }

    pub fn connection_required(&self) -> Option<&ConnectionRequired> {
        match self {
            Self::ConnectionRequired(signal) => Some(signal),
            Self::Completed(_) => None,
        }
    }
}

/// Whether a tool may run right now.
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    /// No provider involved; run without a token
    Open,
    Granted { provider_id: String },
    Required(ConnectionRequired),
}

pub struct ToolExecutionGate {
    scopes: ScopeRegistry,
    store: Arc<ConnectionStore>,
    tools: HashMap<String, Arc<dyn Tool>>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ToolExecutionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tools: Vec<&String> = self.tools.keys().collect();
        tools.sort();
        f.debug_struct("ToolExecutionGate")
            .field("tools", &tools)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ToolExecutionGate {
    pub fn new(scopes: ScopeRegistry, store: Arc<ConnectionStore>) -> Self {
        Self {
            scopes,
            store,
            tools: HashMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Gate using the `[retry]` section of the config.
    pub fn from_config(scopes: ScopeRegistry, store: Arc<ConnectionStore>, config: &GateConfig) -> Self {
        Self::new(scopes, store).with_retry(config.retry_policy())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register a tool (builder pattern); a later tool with the same name wins.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.scopes.provider_for(&name).is_none() {
            debug!(tool = %name, "registering tool without a catalogue provider");
        }
        self.tools.insert(name, tool);
    }

    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn scopes(&self) -> &ScopeRegistry {
        &self.scopes
    }

    /// Check a tool's required scopes against the user's connection.
    pub async fn check_access(&self, tool_name: &str, identity: &Identity) -> Result<Access> {
        let required = self.scopes.required_scopes(tool_name);
        let Some(provider_id) = self.scopes.provider_for(tool_name) else {
            return Ok(Access::Open);
        };
        let provider = self.scopes.providers().require(provider_id)?;

        self.store.ensure_loaded(identity).await?;
        let connection = self.store.get(&identity.user_id, provider_id).await;

        if !connection.connected {
            return Ok(Access::Required(ConnectionRequired::new(
                provider,
                RequiredReason::NotConnected,
                required,
                ScopeSet::new(),
            )));
        }
        if !self.scopes.missing(&connection.granted_scopes, &required).is_empty() {
            return Ok(Access::Required(ConnectionRequired::new(
                provider,
                RequiredReason::InsufficientScopes,
                required,
                connection.granted_scopes,
            )));
        }
        Ok(Access::Granted {
            provider_id: provider_id.to_string(),
        })
    }

    /// Run one tool call, streaming its progress to `writer`.
    pub async fn execute(
        &self,
        invocation: &ToolInvocation,
        identity: &Identity,
        writer: &TurnWriter,
    ) -> Result<ToolOutcome> {
        let tool = self
            .tools
            .get(&invocation.tool)
            .cloned()
            .ok_or_else(|| GateError::ToolNotFound(invocation.tool.clone()))?;

        let (provider_id, token) = match self.check_access(&invocation.tool, identity).await? {
            Access::Open => (None, None),
            Access::Required(signal) => {
                info!(
                    user = %identity.user_id,
                    tool = %invocation.tool,
                    provider = %signal.provider,
                    reason = ?signal.reason,
                    "tool call needs a provider connection"
                );
                return Ok(self.connection_required(invocation, writer, signal).await);
            }
            Access::Granted { provider_id } => {
                match self.store.resolve_token(identity, &provider_id).await {
                    Ok(token) => (Some(provider_id), Some(token)),
                    Err(IdentityError::NotConnected(_)) => {
                        let signal = self.stale_connection(identity, &invocation.tool, &provider_id).await?;
                        return Ok(self.connection_required(invocation, writer, signal).await);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let started = Instant::now();
        emit(writer, ToolEvent::starting(&invocation.tool, &invocation.call_id)).await;
        emit(
            writer,
            ToolEvent::processing(&invocation.tool, &invocation.call_id, format!("Running {}", invocation.tool)),
        )
        .await;

        let mut attempt = 0u32;
        loop {
            let outcome = tool
                .execute(self.context(invocation, identity, token.clone(), writer))
                .await;

            match outcome {
                Ok(result) => {
                    emit(
                        writer,
                        ToolEvent::complete(&invocation.tool, &invocation.call_id, started.elapsed()),
                    )
                    .await;
                    send_result(writer, invocation, &result).await;
                    debug!(tool = %invocation.tool, attempts = attempt + 1, "tool call complete");
                    return Ok(ToolOutcome::Completed(result));
                }
                Err(ToolError::Unauthorized(reason)) => {
                    emit(
                        writer,
                        ToolEvent::error(&invocation.tool, &invocation.call_id, "authorization required", true),
                    )
                    .await;
                    // Only tools with a provider ever receive a token.
                    let Some(provider_id) = provider_id.as_deref() else {
                        let result = ToolResult::failure(format!("authorization failed: {}", reason));
                        send_result(writer, invocation, &result).await;
                        return Ok(ToolOutcome::Completed(result));
                    };
                    warn!(
                        user = %identity.user_id,
                        tool = %invocation.tool,
                        provider = provider_id,
                        reason = %reason,
                        "provider rejected a cached token"
                    );
                    let signal = self.stale_connection(identity, &invocation.tool, provider_id).await?;
                    return Ok(self.connection_required(invocation, writer, signal).await);
                }
                Err(err) if self.retry.should_retry(&err, attempt) => {
                    let delay = self.retry.delay_for(attempt, &err);
                    debug!(tool = %invocation.tool, attempt, ?delay, error = %err, "retrying tool call");
                    emit(
                        writer,
                        ToolEvent::processing(
                            &invocation.tool,
                            &invocation.call_id,
                            format!("Retrying after error: {}", err),
                        ),
                    )
                    .await;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(tool = %invocation.tool, error = %err, "tool call failed");
                    emit(
                        writer,
                        ToolEvent::error(&invocation.tool, &invocation.call_id, err.to_string(), err.is_transient()),
                    )
                    .await;
                    let result = ToolResult::failure(err.to_string());
                    send_result(writer, invocation, &result).await;
                    return Ok(ToolOutcome::Completed(result));
                }
            }
        }
    }

    fn context(
        &self,
        invocation: &ToolInvocation,
        identity: &Identity,
        token: Option<AccessToken>,
        writer: &TurnWriter,
    ) -> ToolContext {
        let ctx = ToolContext::new(
            identity.user_id.as_str(),
            invocation.call_id.as_str(),
            invocation.tool.as_str(),
            invocation.arguments.clone(),
        )
        .with_writer(writer.clone());
        match token {
            Some(token) => ctx.with_token(token),
            None => ctx,
        }
    }

    /// Drop the dead token, re-read server state and build a reconnect signal.
    async fn stale_connection(
        &self,
        identity: &Identity,
        tool_name: &str,
        provider_id: &str,
    ) -> Result<ConnectionRequired> {
        self.store.invalidate(&identity.user_id, provider_id).await;
        if let Err(e) = self.store.refresh(identity).await {
            warn!(user = %identity.user_id, error = %e, "status refresh after token rejection failed");
        }
        let connection = self.store.get(&identity.user_id, provider_id).await;
        let provider = self.scopes.providers().require(provider_id)?;
        let current = if connection.connected {
            connection.granted_scopes
        } else {
            ScopeSet::new()
        };
        Ok(ConnectionRequired::new(
            provider,
            RequiredReason::Stale,
            self.scopes.required_scopes(tool_name),
            current,
        ))
    }

    async fn connection_required(
        &self,
        invocation: &ToolInvocation,
        writer: &TurnWriter,
        signal: ConnectionRequired,
    ) -> ToolOutcome {
        log_undelivered(
            "connection_required",
            writer
                .connection_required(&invocation.tool, &invocation.call_id, &signal)
                .await,
        );
        ToolOutcome::ConnectionRequired(signal)
    }
}

async fn emit(writer: &TurnWriter, event: ToolEvent) {
    log_undelivered("tool_event", writer.tool_event(event).await);
}

async fn send_result(writer: &TurnWriter, invocation: &ToolInvocation, result: &ToolResult) {
    log_undelivered(
        "tool_result",
        writer
            .tool_result(&invocation.tool, &invocation.call_id, result.clone())
            .await,
    );
}

/// A closed turn does not fail the call; the part is dropped.
fn log_undelivered(part: &str, sent: Result<u64>) {
    if let Err(e) = sent {
        debug!(part, error = %e, "dropping turn part");
    }
}
