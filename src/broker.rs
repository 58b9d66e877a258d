//! # Connection Broker
//!
//! Owns every interactive OAuth flow. Each `(user, provider)` key has at most
//! one pending authorization, driven by a single spawned task through
//!
//! ```text
//! Idle -> Requesting -> AwaitingOutcome -> Verifying -> Resolved
//!              \               \                \-----> Rejected
//!               \---------------\-------------------->  Rejected
//! ```
//!
//! Concurrent `connect` calls for a key join the existing flow and settle
//! with the same result. The popup's `oauth-success` message is never
//! trusted on its own: the flow re-queries the identity broker and only
//! resolves `Connected` when the server confirms the requested scopes.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::callback::{normalize_origin, ResumeContext, StateToken, WindowMessage};
use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::identity::{AuthorizationRequest, DisconnectResponse, Identity, IdentityBroker};
use crate::popup::{PopupHandle, PopupLauncher};
use crate::scopes::{missing, scope_set, ScopeRegistry, ScopeSet};
use crate::store::{Connection, ConnectionKey, ConnectionStore};

/// Why a connect attempt was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The user closed the popup; never shown as an error
    #[error("authorization canceled by the user")]
    Canceled,

    #[error("the browser blocked the authorization popup")]
    PopupBlocked,

    #[error("could not start authorization: {0}")]
    Network(String),

    #[error("provider reported an authorization error: {0}")]
    Provider(String),

    #[error("authorization did not complete before the deadline")]
    TimedOut,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

impl ConnectError {
    /// Errors the UI should not surface at all.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::TimedOut)
    }

    /// Text for the UI, or `None` for silent errors.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Canceled => None,
            Self::PopupBlocked => Some(
                "Your browser blocked the sign-in window. Allow pop-ups for this site and try again."
                    .to_string(),
            ),
            Self::Network(_) => {
                Some("Could not reach the sign-in service. Please try again.".to_string())
            }
            Self::Provider(msg) => Some(format!("The provider did not grant access: {}", msg)),
            Self::TimedOut => Some("Sign-in took too long. Please try again.".to_string()),
            Self::UnknownProvider(id) => Some(format!("'{}' cannot be connected.", id)),
        }
    }
}

/// Server-verified result of a completed popup flow.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionOutcome {
    Connected(Connection),
    /// The popup reported success but the server shows no connection
    NotConnected,
    InsufficientScopes { granted: ScopeSet, missing: ScopeSet },
}

impl ConnectionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

pub type ConnectResult = std::result::Result<ConnectionOutcome, ConnectError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationState {
    Idle,
    Requesting,
    AwaitingOutcome,
    Verifying,
    Resolved,
    Rejected,
}

impl AuthorizationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Rejected)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectOptions {
    /// Scopes to request; the provider's defaults when empty
    pub scopes: Vec<String>,
    /// Overrides the configured callback URL
    pub redirect_target: Option<String>,
    pub resume: ResumeContext,
}

impl ConnectOptions {
    pub fn with_scopes<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// What happened to an inbound cross-window message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Accepted,
    ForeignOrigin,
    UnknownState,
    Malformed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub app_origin: String,
    pub redirect_url: String,
    pub deadline: Duration,
    pub poll_interval: Duration,
}

impl BrokerSettings {
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            app_origin: config.app_origin.clone(),
            redirect_url: config.redirect_url(),
            deadline: config.connect_deadline(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Connection status for every catalogue provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionsStatus {
    pub connections: BTreeMap<String, Connection>,
}

struct PendingAuthorization {
    request_id: String,
    state_token: String,
    expected_origin: String,
    listener: mpsc::UnboundedSender<WindowMessage>,
    outcome: Shared<BoxFuture<'static, ConnectResult>>,
}

struct BrokerInner {
    settings: BrokerSettings,
    scopes: ScopeRegistry,
    store: Arc<ConnectionStore>,
    identity: Arc<dyn IdentityBroker>,
    launcher: Arc<dyn PopupLauncher>,
    pending: Mutex<HashMap<ConnectionKey, PendingAuthorization>>,
    states: Mutex<HashMap<ConnectionKey, AuthorizationState>>,
}

enum Signal {
    Success,
    Error(Option<String>),
    Closed,
    Deadline,
}

#[derive(Clone)]
pub struct ConnectionBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for ConnectionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBroker")
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl ConnectionBroker {
    pub fn new(
        settings: BrokerSettings,
        scopes: ScopeRegistry,
        store: Arc<ConnectionStore>,
        identity: Arc<dyn IdentityBroker>,
        launcher: Arc<dyn PopupLauncher>,
    ) -> Result<Self> {
        let settings = BrokerSettings {
            app_origin: normalize_origin(&settings.app_origin)?,
            ..settings
        };
        Ok(Self {
            inner: Arc::new(BrokerInner {
                settings,
                scopes,
                store,
                identity,
                launcher,
                pending: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn store(&self) -> &Arc<ConnectionStore> {
        &self.inner.store
    }

    /// Current flow state for a key; `Idle` before the first connect.
    pub fn state(&self, user_id: &str, provider_id: &str) -> AuthorizationState {
        let key = ConnectionKey::new(user_id, provider_id);
        lock(&self.inner.states)
            .get(&key)
            .copied()
            .unwrap_or(AuthorizationState::Idle)
    }

    pub fn has_pending(&self, user_id: &str, provider_id: &str) -> bool {
        lock(&self.inner.pending).contains_key(&ConnectionKey::new(user_id, provider_id))
    }

    /// Run (or join) the popup flow for a provider.
    pub async fn connect(
        &self,
        identity: &Identity,
        provider_id: &str,
        options: ConnectOptions,
    ) -> ConnectResult {
        if self.inner.scopes.providers().get(provider_id).is_none() {
            return Err(ConnectError::UnknownProvider(provider_id.to_string()));
        }
        let key = ConnectionKey::new(identity.user_id.as_str(), provider_id);

        let outcome = {
            let mut pending = lock(&self.inner.pending);
            match pending.get(&key) {
                Some(existing) => {
                    debug!(user = %identity.user_id, provider = provider_id, request = %existing.request_id, "joining pending authorization");
                    existing.outcome.clone()
                }
                None => {
                    let token = StateToken::new(
                        self.inner.settings.app_origin.clone(),
                        provider_id,
                        options.resume.clone(),
                    );
                    let state_token = token.encode().map_err(|e| ConnectError::Network(e.to_string()))?;
                    let (tx, rx) = mpsc::unbounded_channel();
                    let flow = Flow {
                        inner: Arc::clone(&self.inner),
                        identity: identity.clone(),
                        key: key.clone(),
                        request_id: token.request_id.clone(),
                        state_token: state_token.clone(),
                        options,
                    };
                    set_state(&self.inner, &key, AuthorizationState::Requesting);
                    let handle = tokio::spawn(flow.run(rx));
                    let outcome = async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(ConnectError::Provider(format!("authorization task failed: {}", e))))
                    }
                    .boxed()
                    .shared();
                    pending.insert(
                        key.clone(),
                        PendingAuthorization {
                            request_id: token.request_id,
                            state_token,
                            expected_origin: self.inner.settings.app_origin.clone(),
                            listener: tx,
                            outcome: outcome.clone(),
                        },
                    );
                    info!(user = %identity.user_id, provider = provider_id, "authorization started");
                    outcome
                }
            }
        };

        outcome.await
    }

    /// Entry point for cross-window messages received by the app page.
    ///
    /// Messages are accepted only from the app's own origin and only when
    /// their `state` matches a pending authorization.
    pub fn deliver_message(&self, origin: &str, message: WindowMessage) -> MessageDisposition {
        let origin = match normalize_origin(origin) {
            Ok(origin) if origin == self.inner.settings.app_origin => origin,
            _ => {
                warn!(origin = origin, "ignoring OAuth message from foreign origin");
                return MessageDisposition::ForeignOrigin;
            }
        };

        let pending = lock(&self.inner.pending);
        let target = pending
            .values()
            .find(|p| p.state_token == message.state() && p.expected_origin == origin);
        match target {
            Some(p) => {
                debug!(request = %p.request_id, "OAuth message accepted");
                if p.listener.send(message).is_err() {
                    return MessageDisposition::UnknownState;
                }
                MessageDisposition::Accepted
            }
            None => {
                warn!("ignoring OAuth message with unknown state");
                MessageDisposition::UnknownState
            }
        }
    }

    /// Like [`deliver_message`](Self::deliver_message) for raw JSON payloads.
    pub fn deliver_raw(&self, origin: &str, payload: &str) -> MessageDisposition {
        match serde_json::from_str::<WindowMessage>(payload) {
            Ok(message) => self.deliver_message(origin, message),
            Err(e) => {
                debug!(error = %e, "ignoring malformed OAuth message");
                MessageDisposition::Malformed
            }
        }
    }

    /// Refresh and report status for every catalogue provider.
    pub async fn status(&self, identity: &Identity) -> Result<ConnectionsStatus> {
        let connected = self.inner.store.refresh(identity).await?;
        let connections = self
            .inner
            .scopes
            .providers()
            .providers()
            .map(|p| {
                let connection = connected
                    .get(&p.id)
                    .cloned()
                    .unwrap_or_else(|| Connection::disconnected(p.id.clone()));
                (p.id.clone(), connection)
            })
            .collect();
        Ok(ConnectionsStatus { connections })
    }

    /// Disconnect a provider under the store's disconnect policy.
    pub async fn disconnect(
        &self,
        identity: &Identity,
        provider_id: &str,
    ) -> Result<DisconnectResponse> {
        self.inner.scopes.providers().require(provider_id)?;
        self.inner
            .store
            .disconnect(identity, provider_id)
            .await
            .map_err(GateError::from)?;
        Ok(DisconnectResponse { success: true })
    }
}

struct Flow {
    inner: Arc<BrokerInner>,
    identity: Identity,
    key: ConnectionKey,
    request_id: String,
    state_token: String,
    options: ConnectOptions,
}

impl Flow {
    async fn run(self, messages: mpsc::UnboundedReceiver<WindowMessage>) -> ConnectResult {
        let result = self.drive(messages).await;
        self.finish(&result);
        result
    }

    async fn drive(&self, mut messages: mpsc::UnboundedReceiver<WindowMessage>) -> ConnectResult {
        let provider_id = self.key.provider_id.as_str();
        let requested = if self.options.scopes.is_empty() {
            self.inner.scopes.default_scopes(provider_id)
        } else {
            scope_set(self.options.scopes.iter().cloned())
        };

        let request = AuthorizationRequest {
            provider_id: provider_id.to_string(),
            redirect_url: self
                .options
                .redirect_target
                .clone()
                .unwrap_or_else(|| self.inner.settings.redirect_url.clone()),
            scopes: requested.iter().cloned().collect(),
            state: self.state_token.clone(),
        };
        let deadline = Instant::now() + self.inner.settings.deadline;

        let authorization = match self.inner.identity.authorization_url(&self.identity, &request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(provider = provider_id, error = %e, "failed to obtain authorization URL");
                self.refresh_best_effort().await;
                return Err(ConnectError::Network(e.to_string()));
            }
        };

        let Some(popup) = self.inner.launcher.open(&authorization.authorization_url) else {
            warn!(provider = provider_id, "authorization popup was blocked");
            self.refresh_best_effort().await;
            return Err(ConnectError::PopupBlocked);
        };
        set_state(&self.inner, &self.key, AuthorizationState::AwaitingOutcome);

        let signal = self.await_signal(&mut messages, popup.as_ref(), deadline).await;

        match signal {
            Signal::Success => {
                set_state(&self.inner, &self.key, AuthorizationState::Verifying);
                popup.close();
                self.verify(&requested).await
            }
            Signal::Error(error) => {
                popup.close();
                self.refresh_best_effort().await;
                Err(ConnectError::Provider(
                    error.unwrap_or_else(|| "authorization failed".to_string()),
                ))
            }
            Signal::Closed => {
                debug!(provider = provider_id, "popup closed without a result");
                self.refresh_best_effort().await;
                Err(ConnectError::Canceled)
            }
            Signal::Deadline => {
                popup.close();
                self.refresh_best_effort().await;
                Err(ConnectError::TimedOut)
            }
        }
    }

    async fn await_signal(
        &self,
        messages: &mut mpsc::UnboundedReceiver<WindowMessage>,
        popup: &dyn PopupHandle,
        deadline: Instant,
    ) -> Signal {
        let mut poll = tokio::time::interval(self.inner.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        loop {
            tokio::select! {
                biased;

                message = messages.recv() => match message {
                    Some(WindowMessage::Success { .. }) => return Signal::Success,
                    Some(WindowMessage::Error { error, .. }) => return Signal::Error(error),
                    // The sender lives in the pending map until this flow finishes.
                    None => return Signal::Closed,
                },
                _ = poll.tick() => {
                    if popup.is_closed() {
                        // The callback page posts before closing itself.
                        return match messages.try_recv() {
                            Ok(WindowMessage::Success { .. }) => Signal::Success,
                            Ok(WindowMessage::Error { error, .. }) => Signal::Error(error),
                            Err(_) => Signal::Closed,
                        };
                    }
                }
                _ = &mut expired => return Signal::Deadline,
            }
        }
    }

    /// Trust the server, not the popup.
    async fn verify(&self, requested: &ScopeSet) -> ConnectResult {
        let connection = self
            .inner
            .store
            .reconcile_authorization(&self.identity, &self.key.provider_id)
            .await
            .map_err(|e| ConnectError::Network(e.to_string()))?;

        if !connection.connected {
            warn!(provider = %self.key.provider_id, "popup reported success but the provider is not connected");
            return Ok(ConnectionOutcome::NotConnected);
        }
        let absent = missing(&connection.granted_scopes, requested);
        if !absent.is_empty() {
            warn!(provider = %self.key.provider_id, missing = ?absent, "authorization granted fewer scopes than requested");
            return Ok(ConnectionOutcome::InsufficientScopes {
                granted: connection.granted_scopes,
                missing: absent,
            });
        }
        Ok(ConnectionOutcome::Connected(connection))
    }

    async fn refresh_best_effort(&self) {
        if let Err(e) = self.inner.store.refresh(&self.identity).await {
            warn!(user = %self.identity.user_id, error = %e, "connection status refresh failed");
        }
    }

    fn finish(&self, result: &ConnectResult) {
        let state = if result.is_ok() {
            AuthorizationState::Resolved
        } else {
            AuthorizationState::Rejected
        };
        {
            // Removal and the terminal state are published under one lock.
            let mut pending = lock(&self.inner.pending);
            if pending
                .get(&self.key)
                .is_some_and(|p| p.request_id == self.request_id)
            {
                pending.remove(&self.key);
                set_state(&self.inner, &self.key, state);
            }
        }
        match result {
            Ok(outcome) => info!(
                user = %self.identity.user_id,
                provider = %self.key.provider_id,
                connected = outcome.is_success(),
                "authorization resolved"
            ),
            Err(e) if e.is_silent() => debug!(provider = %self.key.provider_id, "authorization canceled"),
            Err(e) => info!(provider = %self.key.provider_id, error = %e, "authorization rejected"),
        }
    }
}

fn set_state(inner: &BrokerInner, key: &ConnectionKey, state: AuthorizationState) {
    lock(&inner.states).insert(key.clone(), state);
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
