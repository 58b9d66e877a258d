//! # Scopegate
//!
//! OAuth connection brokering and scope-gated tool execution for assistant
//! tool calls.
//!
//! Third-party accounts are connected through an identity broker that owns
//! the OAuth apps and the tokens. This crate decides, per tool call, whether
//! the user has granted what the tool needs. When they have, it runs the
//! tool with a server-resolved token. When they have not, it turns the call
//! into a structured "connect this account" signal on the turn stream
//! instead of failing.
//!
//! - [`ConnectionRegistry`] / [`ScopeRegistry`]: the provider catalogue and
//!   the scopes each tool requires
//! - [`ConnectionStore`]: current belief about each `(user, provider)` connection
//! - [`ConnectionBroker`]: the popup authorization flow and disconnects
//! - [`ToolExecutionGate`]: checks scopes, runs tools, emits parts on a [`TurnWriter`]
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scopegate::{
//!     turn_channel, ConnectionStore, GateConfig, Identity, HttpIdentityBroker,
//!     ScopeRegistry, ToolExecutionGate, ToolInvocation,
//! };
//!
//! # async fn run() -> scopegate::Result<()> {
//! let config = GateConfig::load_default()?;
//! let identity_broker = Arc::new(HttpIdentityBroker::from_config(&config)?);
//! let store = Arc::new(ConnectionStore::from_config(identity_broker, &config));
//! let scopes = ScopeRegistry::new(Arc::new(config.load_registry()?));
//! let gate = ToolExecutionGate::from_config(scopes, store, &config);
//!
//! let (writer, _stream) = turn_channel(64);
//! let call = ToolInvocation::new("calendar_list_events", serde_json::json!({}));
//! let outcome = gate.execute(&call, &Identity::new("user-1"), &writer).await?;
//! if outcome.is_connection_required() {
//!     // the turn stream already carries the connect directive
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod callback;
pub mod config;
pub mod directive;
pub mod error;
pub mod events;
pub mod gate;
pub mod identity;
pub mod popup;
pub mod provider;
pub mod scopes;
pub mod store;
pub mod streaming;
pub mod tool;

pub use broker::{
    AuthorizationState, BrokerSettings, ConnectError, ConnectOptions, ConnectResult,
    ConnectionBroker, ConnectionOutcome, ConnectionsStatus, MessageDisposition,
};
pub use callback::{parse_callback, CallbackMessage, ResumeContext, StateToken, WindowMessage};
pub use config::GateConfig;
pub use directive::{ConnectAction, ConnectionRequired, ConnectionRequiredDirective, RequiredReason};
pub use error::{GateError, Result};
pub use events::ToolEvent;
pub use gate::{Access, RetryPolicy, ToolExecutionGate, ToolInvocation, ToolOutcome};
#[cfg(feature = "http")]
pub use identity::HttpIdentityBroker;
pub use identity::{AccessToken, Identity, IdentityBroker, IdentityError};
pub use popup::{PopupHandle, PopupLauncher, SystemBrowserLauncher};
pub use provider::{ConnectionRegistry, Provider, ToolScopes};
pub use scopes::{ScopeRegistry, ScopeSet};
pub use store::{Connection, ConnectionStore, DisconnectPolicy};
pub use streaming::{turn_channel, PartPayload, TurnPart, TurnRecording, TurnStream, TurnWriter};
pub use tool::{Tool, ToolContext, ToolError, ToolResult};
