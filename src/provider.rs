//! # Provider Catalogue
//!
//! The single source of truth for provider metadata. Every consumer (scope
//! checks, connect prompts, status listings) reads the same injected
//! [`ConnectionRegistry`].
//!
//! # Example providers.toml
//!
//! ```toml
//! [[providers]]
//! id = "google-calendar"
//! display_name = "Google Calendar"
//! default_scopes = ["calendar.readonly"]
//!
//! [[providers.tools]]
//! name = "calendar_create_event"
//! scopes = ["calendar.events"]
//! description = "Create a calendar event"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{GateError, Result};

/// A provider reachable through delegated OAuth access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provider {
    /// Stable provider identifier (e.g. "google-calendar", "slack")
    pub id: String,

    /// Human-readable name shown on connect buttons
    pub display_name: String,

    #[serde(default)]
    pub description: String,

    /// Scopes requested on connect and required by every tool of this provider
    #[serde(default)]
    pub default_scopes: Vec<String>,

    /// Tools backed by this provider and their additional scopes
    #[serde(default)]
    pub tools: Vec<ToolScopes>,
}

/// Scopes a single tool needs on top of its provider's defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolScopes {
    pub name: String,

    #[serde(default)]
    pub scopes: Vec<String>,

    #[serde(default)]
    pub description: String,
}

impl Provider {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            description: String::new(),
            default_scopes: Vec::new(),
            tools: Vec::new(),
        }
    }

    /// Set the default scopes (builder pattern)
    pub fn with_default_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Register a tool with its extra scopes (builder pattern)
    pub fn with_tool<I, S>(mut self, name: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.push(ToolScopes {
            name: name.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            description: String::new(),
        });
        self
    }

    pub fn tool(&self, name: &str) -> Option<&ToolScopes> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// On-disk catalogue layout shared by the TOML and YAML loaders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCatalogue {
    #[serde(default)]
    pub providers: Vec<Provider>,
}

/// Immutable registry of providers, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    providers: Vec<Arc<Provider>>,
    by_id: HashMap<String, usize>,
    tool_owner: HashMap<String, usize>,
}

impl ConnectionRegistry {
    /// Build a registry, rejecting duplicate provider ids and tools claimed
    /// by more than one provider.
    pub fn new(providers: Vec<Provider>) -> Result<Self> {
        let mut registry = Self::default();
        for provider in providers {
            registry.insert(provider)?;
        }
        Ok(registry)
    }

    fn insert(&mut self, provider: Provider) -> Result<()> {
        if provider.id.trim().is_empty() {
            return Err(GateError::Catalogue("provider id must not be empty".to_string()));
        }
        if self.by_id.contains_key(&provider.id) {
            return Err(GateError::Catalogue(format!(
                "duplicate provider id '{}'",
                provider.id
            )));
        }
        let index = self.providers.len();
        for tool in &provider.tools {
            if let Some(&owner) = self.tool_owner.get(&tool.name) {
                return Err(GateError::Catalogue(format!(
                    "tool '{}' is declared by both '{}' and '{}'",
                    tool.name, self.providers[owner].id, provider.id
                )));
            }
            self.tool_owner.insert(tool.name.clone(), index);
        }
        self.by_id.insert(provider.id.clone(), index);
        self.providers.push(Arc::new(provider));
        Ok(())
    }

    /// Built-in catalogue covering calendar, messaging, docs and CRM.
    pub fn builtin() -> Self {
        let providers = vec![
            Provider::new("google-calendar", "Google Calendar")
                .with_default_scopes(["calendar.readonly"])
                .with_tool("calendar_list_events", Vec::<String>::new())
                .with_tool("calendar_create_event", ["calendar.events"]),
            Provider::new("slack", "Slack")
                .with_default_scopes(["channels:read"])
                .with_tool("slack_list_channels", Vec::<String>::new())
                .with_tool("slack_post_message", ["chat:write"]),
            Provider::new("google-docs", "Google Docs")
                .with_default_scopes(["documents.readonly"])
                .with_tool("docs_read_document", Vec::<String>::new()),
            Provider::new("hubspot", "HubSpot CRM")
                .with_default_scopes(["crm.objects.contacts.read"])
                .with_tool("crm_search_contacts", Vec::<String>::new())
                .with_tool("crm_update_contact", ["crm.objects.contacts.write"]),
        ];
        Self::new(providers).unwrap_or_default()
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let catalogue: ProviderCatalogue = toml::from_str(content)
            .map_err(|e| GateError::Catalogue(format!("invalid TOML catalogue: {}", e)))?;
        Self::new(catalogue.providers)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let catalogue: ProviderCatalogue = serde_yaml::from_str(content)
            .map_err(|e| GateError::Catalogue(format!("invalid YAML catalogue: {}", e)))?;
        Self::new(catalogue.providers)
    }

    /// Load a catalogue file; the format is chosen by extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            other => Err(GateError::Catalogue(format!(
                "unsupported catalogue extension {:?} for {:?}",
                other, path
            ))),
        }
    }

    pub fn get(&self, provider_id: &str) -> Option<&Arc<Provider>> {
        self.by_id.get(provider_id).map(|&i| &self.providers[i])
    }

    /// Look up a provider or fail with `ProviderNotFound`.
    pub fn require(&self, provider_id: &str) -> Result<&Arc<Provider>> {
        self.get(provider_id)
            .ok_or_else(|| GateError::ProviderNotFound(provider_id.to_string()))
    }

    /// Provider that owns the given tool
    pub fn provider_for_tool(&self, tool_name: &str) -> Option<&Arc<Provider>> {
        self.tool_owner.get(tool_name).map(|&i| &self.providers[i])
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML_CATALOGUE: &str = r#"
[[providers]]
id = "google-calendar"
display_name = "Google Calendar"
default_scopes = ["calendar.readonly"]

[[providers.tools]]
name = "calendar_create_event"
scopes = ["calendar.events"]

[[providers]]
id = "slack"
display_name = "Slack"
"#;

    #[test]
    fn test_builtin_catalogue() {
        let registry = ConnectionRegistry::builtin();

        assert_eq!(registry.len(), 4);
        let calendar = registry.get("google-calendar").unwrap();
        assert_eq!(calendar.display_name, "Google Calendar");
        assert_eq!(calendar.default_scopes, vec!["calendar.readonly"]);
        assert_eq!(
            registry.provider_for_tool("slack_post_message").unwrap().id,
            "slack"
        );
    }

    #[test]
    fn test_parse_toml_catalogue() {
        let registry = ConnectionRegistry::from_toml_str(TOML_CATALOGUE).unwrap();

        assert_eq!(registry.len(), 2);
        let calendar = registry.get("google-calendar").unwrap();
        let tool = calendar.tool("calendar_create_event").unwrap();
        assert_eq!(tool.scopes, vec!["calendar.events"]);
        assert!(registry.get("slack").unwrap().tools.is_empty());
    }

    #[test]
    fn test_parse_yaml_catalogue() {
        let yaml = r#"
providers:
  - id: hubspot
    display_name: HubSpot CRM
    default_scopes: [crm.objects.contacts.read]
    tools:
      - name: crm_search_contacts
"#;
        let registry = ConnectionRegistry::from_yaml_str(yaml).unwrap();

        let hubspot = registry.get("hubspot").unwrap();
        assert_eq!(hubspot.tools[0].name, "crm_search_contacts");
        assert!(hubspot.tools[0].scopes.is_empty());
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let result = ConnectionRegistry::new(vec![
            Provider::new("slack", "Slack"),
            Provider::new("slack", "Slack again"),
        ]);

        let err = result.unwrap_err();
        assert!(err.to_string().contains("duplicate provider id 'slack'"));
    }

    #[test]
    fn test_tool_claimed_twice_rejected() {
        let result = ConnectionRegistry::new(vec![
            Provider::new("a", "A").with_tool("shared", ["x"]),
            Provider::new("b", "B").with_tool("shared", ["y"]),
        ]);

        let err = result.unwrap_err();
        assert!(err.to_string().contains("declared by both 'a' and 'b'"));
    }

    #[test]
    fn test_require_missing_provider() {
        let registry = ConnectionRegistry::builtin();
        let err = registry.require("dropbox").unwrap_err();
        assert!(matches!(err, GateError::ProviderNotFound(ref id) if id == "dropbox"));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("providers.toml");
        std::fs::write(&toml_path, TOML_CATALOGUE).unwrap();
        assert_eq!(ConnectionRegistry::load(&toml_path).unwrap().len(), 2);

        let json_path = dir.path().join("providers.json");
        std::fs::write(&json_path, "{}").unwrap();
        let err = ConnectionRegistry::load(&json_path).unwrap_err();
        assert!(err.to_string().contains("unsupported catalogue extension"));
    }
}
