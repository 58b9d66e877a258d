//! # Connection Store
//!
//! Current belief about each `(user, provider)` connection, reconciled against
//! the identity broker's status API. Access tokens stay in here; everything
//! outside the store sees only an opaque [`TokenRef`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::GateConfig;
use crate::identity::{AccessToken, Identity, IdentityBroker, IdentityError, StatusResponse};
use crate::scopes::{scope_set, ScopeSet};

/// Opaque handle to a server-side access token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TokenRef(String);

impl TokenRef {
    fn mint() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }
}

impl std::fmt::Debug for TokenRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenRef({})", &self.0[..6.min(self.0.len())])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub user_id: String,
    pub provider_id: String,
}

impl ConnectionKey {
    pub fn new(user_id: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            provider_id: provider_id.into(),
        }
    }
}

/// One provider connection as currently believed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub provider_id: String,
    pub connected: bool,
    pub granted_scopes: ScopeSet,
    /// Expiry as milliseconds since the Unix epoch
    pub expires_at: Option<u64>,
    #[serde(skip)]
    pub token_ref: Option<TokenRef>,
}

impl Connection {
    pub fn disconnected(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            connected: false,
            granted_scopes: ScopeSet::new(),
            expires_at: None,
            token_ref: None,
        }
    }
}

/// What happens when the upstream revoke call fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    /// Report success anyway and keep the provider shown as disconnected.
    #[default]
    Forced,
    /// Clear local state but return the upstream error.
    Strict,
}

#[derive(Default)]
struct StoreState {
    connections: HashMap<ConnectionKey, Connection>,
    tokens: HashMap<TokenRef, AccessToken>,
    /// Keys whose upstream revoke failed; reported disconnected until the
    /// next completed authorization.
    pinned_disconnected: HashSet<ConnectionKey>,
    /// Users whose status has been fetched at least once
    loaded_users: HashSet<String>,
}

impl StoreState {
    fn apply_status(&mut self, user_id: &str, status: &StatusResponse) {
        self.loaded_users.insert(user_id.to_string());
        let stale: Vec<ConnectionKey> = self
            .connections
            .keys()
            .filter(|k| k.user_id == user_id && !status.connections.contains_key(&k.provider_id))
            .cloned()
            .collect();
        for key in stale {
            self.drop_connection(&key);
        }

        for (provider_id, provider_status) in &status.connections {
            let key = ConnectionKey::new(user_id, provider_id.as_str());
            let pinned = self.pinned_disconnected.contains(&key);
            if !provider_status.connected || pinned {
                if pinned && provider_status.connected {
                    debug!(user = user_id, provider = %provider_id, "keeping force-disconnected provider disconnected");
                }
                self.drop_connection(&key);
                continue;
            }

            let token = provider_status.token.clone().unwrap_or_default();
            let granted = scope_set(token.scopes);
            let token_ref = match self.connections.get(&key) {
                Some(existing) if existing.connected && existing.granted_scopes == granted => {
                    existing.token_ref.clone()
                }
                Some(existing) => {
                    if let Some(old) = &existing.token_ref {
                        self.tokens.remove(old);
                    }
                    None
                }
                None => None,
            }
            .unwrap_or_else(TokenRef::mint);

            self.connections.insert(
                key,
                Connection {
                    provider_id: provider_id.clone(),
                    connected: true,
                    granted_scopes: granted,
                    expires_at: token.access_token_expiry,
                    token_ref: Some(token_ref),
                },
            );
        }
    }

    fn drop_connection(&mut self, key: &ConnectionKey) {
        if let Some(existing) = self.connections.remove(key) {
            if let Some(token_ref) = existing.token_ref {
                self.tokens.remove(&token_ref);
            }
        }
    }

    fn snapshot(&self, user_id: &str) -> BTreeMap<String, Connection> {
        self.connections
            .iter()
            .filter(|(k, _)| k.user_id == user_id)
            .map(|(k, c)| (k.provider_id.clone(), c.clone()))
            .collect()
    }
}

/// Shared, lock-guarded connection state for all users.
pub struct ConnectionStore {
    broker: Arc<dyn IdentityBroker>,
    policy: DisconnectPolicy,
    state: RwLock<StoreState>,
}

impl std::fmt::Debug for ConnectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStore")
            .field("broker", &"<IdentityBroker>")
            .field("policy", &self.policy)
            .finish()
    }
}

impl ConnectionStore {
    pub fn new(broker: Arc<dyn IdentityBroker>, policy: DisconnectPolicy) -> Self {
        Self {
            broker,
            policy,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Store using the configured `disconnect_policy`.
    pub fn from_config(broker: Arc<dyn IdentityBroker>, config: &GateConfig) -> Self {
        Self::new(broker, config.disconnect_policy)
    }

    pub fn policy(&self) -> DisconnectPolicy {
        self.policy
    }

    /// Current belief for one key; unknown keys read as disconnected.
    pub async fn get(&self, user_id: &str, provider_id: &str) -> Connection {
        let key = ConnectionKey::new(user_id, provider_id);
        self.state
            .read()
            .await
            .connections
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Connection::disconnected(provider_id))
    }

    /// Connected providers for a user, without querying the broker.
    pub async fn snapshot(&self, user_id: &str) -> BTreeMap<String, Connection> {
        self.state.read().await.snapshot(user_id)
    }

    /// Fetch status once for users the store has never seen.
    pub async fn ensure_loaded(&self, identity: &Identity) -> Result<(), IdentityError> {
        let loaded = self
            .state
            .read()
            .await
            .loaded_users
            .contains(&identity.user_id);
        if !loaded {
            self.refresh(identity).await?;
        }
        Ok(())
    }

    /// Re-query the identity broker and overwrite this user's connections.
    pub async fn refresh(
        &self,
        identity: &Identity,
    ) -> Result<BTreeMap<String, Connection>, IdentityError> {
        let status = self.broker.connection_status(identity).await?;
        let mut state = self.state.write().await;
        state.apply_status(&identity.user_id, &status);
        debug!(user = %identity.user_id, providers = status.connections.len(), "connection status refreshed");
        Ok(state.snapshot(&identity.user_id))
    }

    /// Re-verify a provider right after the popup reported success.
    ///
    /// A completed authorization lifts any forced-disconnect pin for the key.
    pub async fn reconcile_authorization(
        &self,
        identity: &Identity,
        provider_id: &str,
    ) -> Result<Connection, IdentityError> {
        let status = self.broker.connection_status(identity).await?;
        let key = ConnectionKey::new(identity.user_id.as_str(), provider_id);
        let mut state = self.state.write().await;
        state.pinned_disconnected.remove(&key);
        state.apply_status(&identity.user_id, &status);
        Ok(state
            .connections
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Connection::disconnected(provider_id)))
    }

    /// Resolve the live token behind a connection's reference.
    pub async fn resolve_token(
        &self,
        identity: &Identity,
        provider_id: &str,
    ) -> Result<AccessToken, IdentityError> {
        let key = ConnectionKey::new(identity.user_id.as_str(), provider_id);
        let token_ref = {
            let state = self.state.read().await;
            let connection = state
                .connections
                .get(&key)
                .filter(|c| c.connected)
                .ok_or_else(|| IdentityError::NotConnected(provider_id.to_string()))?;
            let token_ref = connection
                .token_ref
                .clone()
                .ok_or_else(|| IdentityError::NotConnected(provider_id.to_string()))?;
            if let Some(token) = state.tokens.get(&token_ref) {
                if !token.is_expired(SystemTime::now()) {
                    return Ok(token.clone());
                }
            }
            token_ref
        };

        let token = self.broker.access_token(identity, provider_id).await?;

        let mut state = self.state.write().await;
        // The connection may have been reconciled while the fetch was in flight.
        let still_current = state
            .connections
            .get(&key)
            .and_then(|c| c.token_ref.as_ref())
            .is_some_and(|r| *r == token_ref);
        if still_current {
            state.tokens.insert(token_ref, token.clone());
        }
        Ok(token)
    }

    /// Forget the token for a provider after a downstream authorization failure.
    pub async fn invalidate(&self, user_id: &str, provider_id: &str) {
        let key = ConnectionKey::new(user_id, provider_id);
        let mut state = self.state.write().await;
        if let Some(connection) = state.connections.get_mut(&key) {
            connection.connected = false;
            if let Some(token_ref) = connection.token_ref.take() {
                state.tokens.remove(&token_ref);
            }
            info!(user = user_id, provider = provider_id, "invalidated stale provider token");
        }
    }

    /// Revoke a provider connection according to the configured policy.
    ///
    /// Local state is cleared before the upstream call is made, so the
    /// provider never reads as connected afterwards.
    pub async fn disconnect(
        &self,
        identity: &Identity,
        provider_id: &str,
    ) -> Result<(), IdentityError> {
        let key = ConnectionKey::new(identity.user_id.as_str(), provider_id);
        self.state.write().await.drop_connection(&key);

        match self.broker.disconnect(identity, provider_id).await {
            Ok(()) => {
                self.state.write().await.pinned_disconnected.remove(&key);
                info!(user = %identity.user_id, provider = provider_id, "provider disconnected");
                if let Err(e) = self.refresh(identity).await {
                    warn!(user = %identity.user_id, error = %e, "status refresh after disconnect failed");
                }
                Ok(())
            }
            Err(e) => {
                self.state.write().await.pinned_disconnected.insert(key);
                warn!(
                    user = %identity.user_id,
                    provider = provider_id,
                    error = %e,
                    policy = ?self.policy,
                    "upstream revoke failed"
                );
                match self.policy {
                    DisconnectPolicy::Forced => Ok(()),
                    DisconnectPolicy::Strict => Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::identity::{AuthorizationRequest, AuthorizationResponse, ProviderStatus, TokenInfo};

    /// In-memory identity broker with scriptable responses.
    #[derive(Default)]
    pub struct FakeIdentityBroker {
        pub status: Mutex<StatusResponse>,
        pub fail_authorize: Mutex<Option<IdentityError>>,
        pub fail_disconnect: Mutex<Option<IdentityError>>,
        pub authorize_calls: AtomicUsize,
        pub status_calls: AtomicUsize,
        pub token_calls: AtomicUsize,
        pub last_request: Mutex<Option<AuthorizationRequest>>,
    }

    impl FakeIdentityBroker {
        pub fn set_connected(&self, provider: &str, scopes: &[&str]) {
            self.status.lock().unwrap().connections.insert(
                provider.to_string(),
                ProviderStatus {
                    connected: true,
                    token: Some(TokenInfo {
                        scopes: scopes.iter().map(|s| s.to_string()).collect(),
                        access_token_expiry: None,
                    }),
                },
            );
        }

        pub fn set_disconnected(&self, provider: &str) {
            self.status.lock().unwrap().connections.insert(
                provider.to_string(),
                ProviderStatus {
                    connected: false,
                    token: None,
                },
            );
        }
    }

    #[async_trait]
    impl IdentityBroker for FakeIdentityBroker {
        async fn authorization_url(
            &self,
            _identity: &Identity,
            request: &AuthorizationRequest,
        ) -> Result<AuthorizationResponse, IdentityError> {
            self.authorize_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            if let Some(err) = self.fail_authorize.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(AuthorizationResponse {
                authorization_url: format!(
                    "https://id.example.com/authorize?provider={}",
                    request.provider_id
                ),
            })
        }

        async fn connection_status(
            &self,
            _identity: &Identity,
        ) -> Result<StatusResponse, IdentityError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.status.lock().unwrap().clone())
        }

        async fn disconnect(
            &self,
            _identity: &Identity,
            provider_id: &str,
        ) -> Result<(), IdentityError> {
            if let Some(err) = self.fail_disconnect.lock().unwrap().clone() {
                return Err(err);
            }
            self.set_disconnected(provider_id);
            Ok(())
        }

        async fn access_token(
            &self,
            _identity: &Identity,
            provider_id: &str,
        ) -> Result<AccessToken, IdentityError> {
            let n = self.token_calls.fetch_add(1, Ordering::SeqCst);
            let status = self.status.lock().unwrap();
            match status.connections.get(provider_id) {
                Some(s) if s.connected => Ok(AccessToken::new(format!("{}-token-{}", provider_id, n))),
                _ => Err(IdentityError::NotConnected(provider_id.to_string())),
            }
        }
    }
}
