//! # Workspace Tools
//!
//! Provider-backed tools for [`scopegate`]: Google Calendar, Slack and
//! HubSpot CRM. Tool names match the built-in provider catalogue, so the
//! gate knows which connection and scopes each one needs.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scopegate::{ConnectionRegistry, ConnectionStore, ScopeRegistry, ToolExecutionGate};
//! # fn gate(store: Arc<ConnectionStore>) -> ToolExecutionGate {
//! let mut gate = ToolExecutionGate::new(
//!     ScopeRegistry::new(Arc::new(ConnectionRegistry::builtin())),
//!     store,
//! );
//! for tool in workspace_tools::all(&workspace_tools::Endpoints::default()) {
//!     gate.register(tool);
//! }
//! # gate
//! # }
//! ```

pub mod calendar;
pub mod crm;
pub mod http;
pub mod slack;

use scopegate::Tool;
use std::sync::Arc;

pub use http::ApiClient;

/// Base URLs for each provider API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub calendar: String,
    pub slack: String,
    pub crm: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            calendar: calendar::DEFAULT_BASE_URL.to_string(),
            slack: slack::DEFAULT_BASE_URL.to_string(),
            crm: crm::DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Every tool in this crate, sharing one HTTP client.
pub fn all(endpoints: &Endpoints) -> Vec<Arc<dyn Tool>> {
    with_client(reqwest::Client::new(), endpoints)
}

pub fn with_client(http: reqwest::Client, endpoints: &Endpoints) -> Vec<Arc<dyn Tool>> {
    let calendar = ApiClient::new(http.clone(), endpoints.calendar.as_str());
    vec![
        Arc::new(calendar::ListEventsTool::new(calendar.clone())),
        Arc::new(calendar::CreateEventTool::new(calendar)),
        Arc::new(slack::PostMessageTool::new(ApiClient::new(
            http.clone(),
            endpoints.slack.as_str(),
        ))),
        Arc::new(crm::SearchContactsTool::new(ApiClient::new(http, endpoints.crm.as_str()))),
    ]
}
