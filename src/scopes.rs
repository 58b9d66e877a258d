use std::collections::BTreeSet;
use std::sync::Arc;

use crate::provider::ConnectionRegistry;

/// Ordered set of OAuth scope names.
pub type ScopeSet = BTreeSet<String>;

/// Build a [`ScopeSet`] from anything yielding scope names.
pub fn scope_set<I, S>(scopes: I) -> ScopeSet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    scopes.into_iter().map(Into::into).collect()
}

/// Scopes in `required` that `granted` does not carry.
pub fn missing(granted: &ScopeSet, required: &ScopeSet) -> ScopeSet {
    required.difference(granted).cloned().collect()
}

/// Static knowledge of which scopes each tool requires.
///
/// Derived from the [`ConnectionRegistry`]; a tool needs its provider's
/// default scopes plus its own. Unknown tools need nothing.
#[derive(Debug, Clone)]
pub struct ScopeRegistry {
    providers: Arc<ConnectionRegistry>,
}

impl ScopeRegistry {
    pub fn new(providers: Arc<ConnectionRegistry>) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> &Arc<ConnectionRegistry> {
        &self.providers
    }

    /// Provider id owning `tool_name`, if the catalogue knows the tool.
    pub fn provider_for(&self, tool_name: &str) -> Option<&str> {
        self.providers
            .provider_for_tool(tool_name)
            .map(|p| p.id.as_str())
    }

    pub fn required_scopes(&self, tool_name: &str) -> ScopeSet {
        let Some(provider) = self.providers.provider_for_tool(tool_name) else {
            return ScopeSet::new();
        };
        let mut required = scope_set(provider.default_scopes.iter().cloned());
        if let Some(tool) = provider.tool(tool_name) {
            required.extend(tool.scopes.iter().cloned());
        }
        required
    }

    /// Default scopes requested when connecting a provider without an
    /// explicit scope list.
    pub fn default_scopes(&self, provider_id: &str) -> ScopeSet {
        self.providers
            .get(provider_id)
            .map(|p| scope_set(p.default_scopes.iter().cloned()))
            .unwrap_or_default()
    }

    pub fn missing(&self, granted: &ScopeSet, required: &ScopeSet) -> ScopeSet {
        missing(granted, required)
    }
}
