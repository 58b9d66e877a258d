//! # Connection-Required Signal
//!
//! Returned by the gate when a tool cannot run for lack of a connection or
//! scopes. It is a normal result branch, not an error, and it is what the
//! rendering layer turns into a connect button:
//!
//! ```json
//! {
//!   "type": "connection_required",
//!   "service": "google-calendar",
//!   "message": "Google Calendar needs additional permissions: calendar.events.",
//!   "requiredScopes": ["calendar.events", "calendar.readonly"],
//!   "currentScopes": ["calendar.readonly"],
//!   "connectButton": {"text": "Grant Google Calendar access", "action": "connect:google-calendar"}
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GateError;
use crate::provider::Provider;
use crate::scopes::{missing, ScopeSet};

const CONNECT_ACTION_PREFIX: &str = "connect:";

/// Action passed back into `ConnectionBroker::connect` by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectAction {
    pub provider_id: String,
}

impl ConnectAction {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
        }
    }
}

impl fmt::Display for ConnectAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", CONNECT_ACTION_PREFIX, self.provider_id)
    }
}

impl FromStr for ConnectAction {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(CONNECT_ACTION_PREFIX) {
            Some(id) if !id.is_empty() => Ok(Self::new(id)),
            _ => Err(GateError::InvalidArguments(format!(
                "not a connect action: '{}'",
                s
            ))),
        }
    }
}

impl Serialize for ConnectAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConnectAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Why a connection is required.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequiredReason {
    NotConnected,
    InsufficientScopes,
    /// The downstream API rejected a token the store believed valid
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequired {
    pub provider: String,
    pub provider_name: String,
    pub reason: RequiredReason,
    pub message: String,
    pub required_scopes: ScopeSet,
    pub current_scopes: ScopeSet,
    pub connect_action: ConnectAction,
}

impl ConnectionRequired {
    pub fn new(
        provider: &Provider,
        reason: RequiredReason,
        required_scopes: ScopeSet,
        current_scopes: ScopeSet,
    ) -> Self {
        let name = &provider.display_name;
        let message = match reason {
            RequiredReason::NotConnected => {
                format!("Connect your {} account to continue.", name)
            }
            RequiredReason::InsufficientScopes => {
                let absent = missing(&current_scopes, &required_scopes);
                let needed: Vec<&str> = absent.iter().map(String::as_str).collect();
                format!(
                    "{} needs additional permissions: {}.",
                    name,
                    needed.join(", ")
                )
            }
            RequiredReason::Stale => format!(
                "Your {} connection has expired or was revoked. Reconnect to continue.",
                name
            ),
        };
        Self {
            provider: provider.id.clone(),
            provider_name: name.clone(),
            reason,
            message,
            required_scopes,
            current_scopes,
            connect_action: ConnectAction::new(provider.id.clone()),
        }
    }

    /// Scopes the user still has to grant.
    pub fn missing_scopes(&self) -> ScopeSet {
        missing(&self.current_scopes, &self.required_scopes)
    }

    pub fn button_text(&self) -> String {
        match self.reason {
            RequiredReason::NotConnected => format!("Connect {}", self.provider_name),
            RequiredReason::InsufficientScopes => format!("Grant {} access", self.provider_name),
            RequiredReason::Stale => format!("Reconnect {}", self.provider_name),
        }
    }

    /// Wire shape consumed by the rendering layer.
    pub fn to_directive(&self) -> ConnectionRequiredDirective {
        ConnectionRequiredDirective {
            directive_type: DirectiveType::ConnectionRequired,
            service: self.provider.clone(),
            message: self.message.clone(),
            required_scopes: self.required_scopes.iter().cloned().collect(),
            current_scopes: self.current_scopes.iter().cloned().collect(),
            connect_button: ConnectButton {
                text: self.button_text(),
                action: self.connect_action.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveType {
    ConnectionRequired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequiredDirective {
    #[serde(rename = "type")]
    pub directive_type: DirectiveType,
    pub service: String,
    pub message: String,
    pub required_scopes: Vec<String>,
    pub current_scopes: Vec<String>,
    pub connect_button: ConnectButton,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectButton {
    pub text: String,
    pub action: ConnectAction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scopes::scope_set;
    use serde_json::json;

    fn calendar() -> Provider {
        Provider::new("google-calendar", "Google Calendar")
    }

    #[test]
    fn test_connect_action_roundtrip_through_string() {
        let action = ConnectAction::new("slack");
        assert_eq!(action.to_string(), "connect:slack");
        assert_eq!("connect:slack".parse::<ConnectAction>().unwrap(), action);
    }

    #[test]
    fn test_connect_action_rejects_other_strings() {
        assert!("connect:".parse::<ConnectAction>().is_err());
        assert!("open:slack".parse::<ConnectAction>().is_err());
    }

    #[test]
    fn test_insufficient_scopes_message_names_missing() {
        let required = scope_set(["calendar.readonly", "calendar.events"]);
        let current = scope_set(["calendar.readonly"]);
        let signal = ConnectionRequired::new(
            &calendar(),
            RequiredReason::InsufficientScopes,
            required,
            current,
        );

        assert_eq!(
            signal.message,
            "Google Calendar needs additional permissions: calendar.events."
        );
        assert_eq!(signal.missing_scopes(), scope_set(["calendar.events"]));
    }

    #[test]
    fn test_directive_wire_shape() {
        let signal = ConnectionRequired::new(
            &calendar(),
            RequiredReason::InsufficientScopes,
            scope_set(["calendar.readonly", "calendar.events"]),
            scope_set(["calendar.readonly"]),
        );

        let value = serde_json::to_value(signal.to_directive()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "connection_required",
                "service": "google-calendar",
                "message": "Google Calendar needs additional permissions: calendar.events.",
                "requiredScopes": ["calendar.events", "calendar.readonly"],
                "currentScopes": ["calendar.readonly"],
                "connectButton": {
                    "text": "Grant Google Calendar access",
                    "action": "connect:google-calendar"
                }
            })
        );
    }

    #[test]
    fn test_button_text_per_reason() {
        let provider = Provider::new("slack", "Slack");
        let make = |reason| {
            ConnectionRequired::new(&provider, reason, ScopeSet::new(), ScopeSet::new()).button_text()
        };

        assert_eq!(make(RequiredReason::NotConnected), "Connect Slack");
        assert_eq!(make(RequiredReason::Stale), "Reconnect Slack");
    }
}
