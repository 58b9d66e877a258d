//! # Identity Broker
//!
//! The third-party service that owns OAuth client registrations and stores
//! the user's provider tokens. Scopegate only talks to it through
//! [`IdentityBroker`]; [`HttpIdentityBroker`] is the JSON-over-HTTP client.
//!
//! Wire shapes:
//!
//! ```text
//! POST {base}/connect      {providerId, redirectUrl, scopes, state} -> {authorizationUrl}
//! GET  {base}/connections                                        -> {connections: {...}}
//! POST {base}/disconnect   {providerId}                          -> {success}
//! POST {base}/tokens       {providerId}                          -> {accessToken, expiresAt?, scopes}
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// The user on whose behalf a request is made.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    bearer: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            bearer: None,
        }
    }

    /// Attach the caller's bearer credential (builder pattern)
    pub fn with_bearer(mut self, bearer: impl Into<String>) -> Self {
        self.bearer = Some(bearer.into());
        self
    }

    pub fn bearer(&self) -> Option<&str> {
        self.bearer.as_deref()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    pub provider_id: String,
    pub redirect_url: String,
    pub scopes: Vec<String>,
    /// Origin-bound state token echoed back to the callback page
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationResponse {
    pub authorization_url: String,
}

/// Server-side view of every provider connection for one user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    #[serde(default)]
    pub connections: BTreeMap<String, ProviderStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Expiry as milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_expiry: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub provider_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisconnectResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub provider_id: String,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub access_token: String,
    /// Expiry as milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl AccessToken {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
            scopes: Vec::new(),
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(ms) => millis_to_system_time(ms) <= now,
            None => false,
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

pub(crate) fn millis_to_system_time(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// Identity broker errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    #[error("identity broker unreachable: {0}")]
    Network(String),

    #[error("identity broker rejected the caller's credential")]
    Unauthorized,

    #[error("provider not connected: {0}")]
    NotConnected(String),

    #[error("identity broker returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid identity broker response: {0}")]
    InvalidResponse(String),
}

/// Interface to the identity broker's outbound-connect and management APIs.
#[async_trait]
pub trait IdentityBroker: Send + Sync {
    /// Ask for a provider authorization URL to open in the popup.
    async fn authorization_url(
        &self,
        identity: &Identity,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizationResponse, IdentityError>;

    /// Query server-side connection status for every provider.
    async fn connection_status(&self, identity: &Identity) -> Result<StatusResponse, IdentityError>;

    /// Revoke the user's connection to a provider.
    async fn disconnect(&self, identity: &Identity, provider_id: &str) -> Result<(), IdentityError>;

    /// Resolve a live access token for a connected provider.
    async fn access_token(
        &self,
        identity: &Identity,
        provider_id: &str,
    ) -> Result<AccessToken, IdentityError>;
}

#[cfg(feature = "http")]
pub use http::HttpIdentityBroker;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use crate::config::GateConfig;
    use crate::error::GateError;
    use reqwest::StatusCode;
    use url::Url;

    /// JSON-over-HTTP identity broker client.
    #[derive(Debug, Clone)]
    pub struct HttpIdentityBroker {
        client: reqwest::Client,
        base_url: Url,
    }

    impl HttpIdentityBroker {
        pub fn new(base_url: Url, timeout: Duration) -> Result<Self, IdentityError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| IdentityError::Network(e.to_string()))?;
            Ok(Self::with_client(client, base_url))
        }

        /// Client for `[identity]`: its base URL and request timeout.
        pub fn from_config(config: &GateConfig) -> crate::Result<Self> {
            let base_url = Url::parse(&config.identity.base_url).map_err(|e| {
                GateError::Config(format!(
                    "invalid identity base_url '{}': {}",
                    config.identity.base_url, e
                ))
            })?;
            Ok(Self::new(base_url, config.identity_timeout())?)
        }

        pub fn with_client(client: reqwest::Client, mut base_url: Url) -> Self {
            // Url::join drops the last path segment unless it ends in '/'.
            if !base_url.path().ends_with('/') {
                let path = format!("{}/", base_url.path());
                base_url.set_path(&path);
            }
            Self { client, base_url }
        }

        pub fn base_url(&self) -> &Url {
            &self.base_url
        }

        fn endpoint(&self, path: &str) -> Result<Url, IdentityError> {
            self.base_url
                .join(path)
                .map_err(|e| IdentityError::InvalidResponse(format!("bad endpoint {}: {}", path, e)))
        }

        fn authorize(
            &self,
            builder: reqwest::RequestBuilder,
            identity: &Identity,
        ) -> reqwest::RequestBuilder {
            match identity.bearer() {
                Some(token) => builder.bearer_auth(token),
                None => builder,
            }
        }

        async fn send_json<T: serde::de::DeserializeOwned>(
            &self,
            builder: reqwest::RequestBuilder,
        ) -> Result<T, IdentityError> {
            let response = builder
                .send()
                .await
                .map_err(|e| IdentityError::Network(e.to_string()))?;
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(IdentityError::Unauthorized);
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(IdentityError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            response
                .json::<T>()
                .await
                .map_err(|e| IdentityError::InvalidResponse(e.to_string()))
        }
    }

    #[async_trait]
    impl IdentityBroker for HttpIdentityBroker {
        async fn authorization_url(
            &self,
            identity: &Identity,
            request: &AuthorizationRequest,
        ) -> Result<AuthorizationResponse, IdentityError> {
            let url = self.endpoint("connect")?;
            let builder = self.authorize(self.client.post(url).json(request), identity);
            self.send_json(builder).await
        }

        async fn connection_status(
            &self,
            identity: &Identity,
        ) -> Result<StatusResponse, IdentityError> {
            let url = self.endpoint("connections")?;
            let builder = self.authorize(self.client.get(url), identity);
            self.send_json(builder).await
        }

        async fn disconnect(
            &self,
            identity: &Identity,
            provider_id: &str,
        ) -> Result<(), IdentityError> {
            let url = self.endpoint("disconnect")?;
            let body = DisconnectRequest {
                provider_id: provider_id.to_string(),
            };
            let builder = self.authorize(self.client.post(url).json(&body), identity);
            let response: DisconnectResponse = self.send_json(builder).await?;
            if response.success {
                Ok(())
            } else {
                Err(IdentityError::Status {
                    status: 200,
                    body: "revoke reported success=false".to_string(),
                })
            }
        }

        async fn access_token(
            &self,
            identity: &Identity,
            provider_id: &str,
        ) -> Result<AccessToken, IdentityError> {
            let url = self.endpoint("tokens")?;
            let body = TokenRequest {
                provider_id: provider_id.to_string(),
            };
            let builder = self.authorize(self.client.post(url).json(&body), identity);
            match self.send_json(builder).await {
                Err(IdentityError::Status { status: 404, .. }) => {
                    Err(IdentityError::NotConnected(provider_id.to_string()))
                }
                other => other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[cfg(feature = "http")]
    mod http_client {
        use super::super::*;
        use crate::config::GateConfig;
        use serde_json::{json, Value};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};
        use tokio::sync::mpsc;

        /// One canned response per connection; raw requests come back on the channel.
        async fn serve(responses: Vec<(u16, String)>) -> (String, mpsc::UnboundedReceiver<String>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (tx, rx) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                for (status, body) in responses {
                    let (mut stream, _) = listener.accept().await.expect("accept");
                    let _ = tx.send(read_request(&mut stream).await);
                    let response = format!(
                        "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                }
            });

            (format!("http://{}/api", addr), rx)
        }

        async fn read_request(stream: &mut TcpStream) -> String {
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
            }
            String::from_utf8_lossy(&raw).to_string()
        }

        fn body_of(request: &str) -> Value {
            let (_, body) = request.split_once("\r\n\r\n").expect("request body");
            serde_json::from_str(body).unwrap()
        }

        fn client(base: &str) -> HttpIdentityBroker {
            HttpIdentityBroker::new(url::Url::parse(base).unwrap(), Duration::from_secs(5)).unwrap()
        }

        fn user() -> Identity {
            Identity::new("user-1").with_bearer("session-abc")
        }

        #[tokio::test]
        async fn test_connect_sends_bearer_and_camel_case_body() {
            let (base, mut requests) = serve(vec![(
                200,
                json!({"authorizationUrl": "https://accounts.example.com/o/auth?x=1"}).to_string(),
            )])
            .await;
            let request = AuthorizationRequest {
                provider_id: "google-calendar".to_string(),
                redirect_url: "https://chat.example.com/oauth/callback".to_string(),
                scopes: vec!["calendar.readonly".to_string()],
                state: "st".to_string(),
            };

            let response = client(&base).authorization_url(&user(), &request).await.unwrap();
            assert_eq!(response.authorization_url, "https://accounts.example.com/o/auth?x=1");

            let raw = requests.recv().await.unwrap();
            assert!(raw.starts_with("POST /api/connect "));
            assert!(raw.to_ascii_lowercase().contains("authorization: bearer session-abc"));
            assert_eq!(
                body_of(&raw),
                json!({
                    "providerId": "google-calendar",
                    "redirectUrl": "https://chat.example.com/oauth/callback",
                    "scopes": ["calendar.readonly"],
                    "state": "st"
                })
            );
        }

        #[tokio::test]
        async fn test_status_without_bearer_sends_no_authorization() {
            let (base, mut requests) = serve(vec![(
                200,
                json!({"connections": {"slack": {"connected": true, "token": {"scopes": ["chat:write"]}}}})
                    .to_string(),
            )])
            .await;

            let status = client(&base).connection_status(&Identity::new("user-1")).await.unwrap();
            assert!(status.connections["slack"].connected);

            let raw = requests.recv().await.unwrap();
            assert!(raw.starts_with("GET /api/connections "));
            assert!(!raw.to_ascii_lowercase().contains("authorization:"));
        }

        #[tokio::test]
        async fn test_rejected_credentials_are_unauthorized() {
            let (base, _) = serve(vec![
                (401, "{}".to_string()),
                (403, "{}".to_string()),
            ])
            .await;
            let broker = client(&base);

            for _ in 0..2 {
                let err = broker.connection_status(&user()).await.unwrap_err();
                assert_eq!(err, IdentityError::Unauthorized);
            }
        }

        #[tokio::test]
        async fn test_token_not_found_is_not_connected() {
            let (base, mut requests) = serve(vec![(404, "{\"error\":\"no connection\"}".to_string())]).await;

            let err = client(&base).access_token(&user(), "slack").await.unwrap_err();
            assert_eq!(err, IdentityError::NotConnected("slack".to_string()));

            let raw = requests.recv().await.unwrap();
            assert!(raw.starts_with("POST /api/tokens "));
            assert_eq!(body_of(&raw), json!({"providerId": "slack"}));
        }

        #[tokio::test]
        async fn test_token_response_is_decoded() {
            let (base, _) = serve(vec![(
                200,
                json!({"accessToken": "xoxb-1", "expiresAt": 1700000000000u64, "scopes": ["chat:write"]})
                    .to_string(),
            )])
            .await;

            let token = client(&base).access_token(&user(), "slack").await.unwrap();
            assert_eq!(token.access_token, "xoxb-1");
            assert_eq!(token.expires_at, Some(1_700_000_000_000));
            assert_eq!(token.scopes, vec!["chat:write"]);
        }

        #[tokio::test]
        async fn test_disconnect_reporting_failure_is_an_error() {
            let (base, mut requests) = serve(vec![
                (200, json!({"success": false}).to_string()),
                (200, json!({"success": true}).to_string()),
            ])
            .await;
            let broker = client(&base);

            let err = broker.disconnect(&user(), "hubspot").await.unwrap_err();
            assert!(matches!(err, IdentityError::Status { status: 200, .. }));
            broker.disconnect(&user(), "hubspot").await.unwrap();

            let raw = requests.recv().await.unwrap();
            assert!(raw.starts_with("POST /api/disconnect "));
            assert_eq!(body_of(&raw), json!({"providerId": "hubspot"}));
        }

        #[tokio::test]
        async fn test_server_error_keeps_status_and_body() {
            let (base, _) = serve(vec![(502, "upstream down".to_string())]).await;

            let err = client(&base).connection_status(&user()).await.unwrap_err();
            assert_eq!(
                err,
                IdentityError::Status {
                    status: 502,
                    body: "upstream down".to_string()
                }
            );
        }

        #[tokio::test]
        async fn test_from_config_uses_identity_section() {
            let (base, mut requests) = serve(vec![(200, json!({"connections": {}}).to_string())]).await;
            let config = GateConfig::from_toml_str(&format!(
                "app_origin = \"https://chat.example.com\"\n[identity]\nbase_url = \"{}\"\ntimeout_secs = 3\n",
                base
            ))
            .unwrap();

            let broker = HttpIdentityBroker::from_config(&config).unwrap();
            assert_eq!(broker.base_url().as_str(), format!("{}/", base));
            broker.connection_status(&user()).await.unwrap();
            assert!(requests.recv().await.unwrap().starts_with("GET /api/connections "));
        }
    }

    #[test]
    fn test_status_response_wire_shape() {
        let body = json!({
            "connections": {
                "google-calendar": {
                    "connected": true,
                    "token": {"scopes": ["calendar.readonly"], "accessTokenExpiry": 1700000000000u64}
                },
                "slack": {"connected": false}
            }
        });

        let status: StatusResponse = serde_json::from_value(body).unwrap();

        let calendar = &status.connections["google-calendar"];
        assert!(calendar.connected);
        let token = calendar.token.as_ref().unwrap();
        assert_eq!(token.scopes, vec!["calendar.readonly"]);
        assert_eq!(token.access_token_expiry, Some(1_700_000_000_000));
        assert!(!status.connections["slack"].connected);
        assert!(status.connections["slack"].token.is_none());
    }

    #[test]
    fn test_authorization_request_is_camel_case() {
        let request = AuthorizationRequest {
            provider_id: "slack".to_string(),
            redirect_url: "https://app.example.com/oauth/callback".to_string(),
            scopes: vec!["chat:write".to_string()],
            state: "abc".to_string(),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["providerId"], "slack");
        assert_eq!(value["redirectUrl"], "https://app.example.com/oauth/callback");
        assert_eq!(value["scopes"][0], "chat:write");
    }

    #[test]
    fn test_access_token_debug_redacts_secret() {
        let token = AccessToken::new("ya29.secret-value");
        let debug = format!("{:?}", token);

        assert!(!debug.contains("secret-value"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_identity_debug_redacts_bearer() {
        let identity = Identity::new("user-1").with_bearer("session-jwt");
        let debug = format!("{:?}", identity);

        assert!(debug.contains("user-1"));
        assert!(!debug.contains("session-jwt"));
    }

    #[test]
    fn test_access_token_expiry() {
        let mut token = AccessToken::new("t");
        assert!(!token.is_expired(SystemTime::now()));

        token.expires_at = Some(1_000);
        assert!(token.is_expired(SystemTime::now()));
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_http_broker_normalizes_base_path() {
        let base = url::Url::parse("https://id.example.com/api/v1").unwrap();
        let broker = HttpIdentityBroker::with_client(reqwest::Client::new(), base);

        assert_eq!(broker.base_url().as_str(), "https://id.example.com/api/v1/");
    }
}
