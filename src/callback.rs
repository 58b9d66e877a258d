//! # Popup Callback Contract
//!
//! The popup's terminal page reads `code`, `error` and `state` from its own
//! URL and posts a [`WindowMessage`] to its opener, restricted to the origin
//! recorded in the [`StateToken`].
//!
//! ```text
//! https://app.example.com/oauth/callback?code=...&state=<token>
//!     -> {"type": "oauth-success", "state": "<token>"}    (to https://app.example.com)
//! https://app.example.com/oauth/callback?error=access_denied&state=<token>
//!     -> {"type": "oauth-error", "state": "<token>", "error": "access_denied"}
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{GateError, Result};

/// Where to send the user back to once the popup flow completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResumeContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
}

/// Origin-bound OAuth `state` parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateToken {
    pub request_id: String,
    pub origin: String,
    pub provider_id: String,
    #[serde(default)]
    pub resume: ResumeContext,
}

impl StateToken {
    pub fn new(origin: impl Into<String>, provider_id: impl Into<String>, resume: ResumeContext) -> Self {
        let mut bytes = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            request_id: URL_SAFE_NO_PAD.encode(bytes),
            origin: origin.into(),
            provider_id: provider_id.into(),
            resume,
        }
    }

    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| GateError::InvalidCallback(format!("state is not base64: {}", e)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Message posted from the popup's callback page to its opener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WindowMessage {
    #[serde(rename = "oauth-success")]
    Success { state: String },

    #[serde(rename = "oauth-error")]
    Error {
        state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WindowMessage {
    pub fn state(&self) -> &str {
        match self {
            Self::Success { state } => state,
            Self::Error { state, .. } => state,
        }
    }
}

/// What the callback page should post, and where.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackMessage {
    pub message: WindowMessage,
    /// Opener origin the message is restricted to
    pub target_origin: String,
    pub resume: ResumeContext,
}

/// ASCII-serialized origin of a URL (`scheme://host[:port]`).
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Normalize an origin string such as `https://App.example.com/` to
/// `https://app.example.com`.
pub fn normalize_origin(origin: &str) -> Result<String> {
    let url = Url::parse(origin)
        .map_err(|e| GateError::Config(format!("invalid origin '{}': {}", origin, e)))?;
    let normalized = origin_of(&url);
    if normalized == "null" {
        return Err(GateError::Config(format!("origin '{}' is opaque", origin)));
    }
    Ok(normalized)
}

/// Parse the callback page URL into the message it posts to its opener.
pub fn parse_callback(callback_url: &Url) -> Result<CallbackMessage> {
    let mut code = None;
    let mut error = None;
    let mut error_description = None;
    let mut state = None;
    for (key, value) in callback_url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => error_description = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }

    let state = state.ok_or_else(|| GateError::InvalidCallback("missing state".to_string()))?;
    let token = StateToken::decode(&state)?;

    let message = match (code, error) {
        (_, Some(error)) => WindowMessage::Error {
            state,
            error: Some(match error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error,
            }),
        },
        (Some(_), None) => WindowMessage::Success { state },
        (None, None) => WindowMessage::Error {
            state,
            error: Some("missing authorization code".to_string()),
        },
    };

    Ok(CallbackMessage {
        message,
        target_origin: token.origin,
        resume: token.resume,
    })
}
