//! HubSpot CRM tools.

use async_trait::async_trait;
use scopegate::{Tool, ToolContext, ToolError, ToolResult};
use serde_json::{json, Map, Value};

use crate::http::{send_json, ApiClient};

pub const DEFAULT_BASE_URL: &str = "https://api.hubapi.com";
const CONTACT_PROPERTIES: &[&str] = &["firstname", "lastname", "email", "company"];

/// `crm_search_contacts`: full-text contact search.
#[derive(Debug, Clone)]
pub struct SearchContactsTool {
    api: ApiClient,
}

impl SearchContactsTool {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Tool for SearchContactsTool {
    fn name(&self) -> &str {
        "crm_search_contacts"
    }

    fn description(&self) -> &str {
        "Search CRM contacts by name, email or company"
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolResult, ToolError> {
        let query = ctx.str_arg("query")?;
        let limit = ctx
            .arguments
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(10)
            .clamp(1, 100);

        ctx.progress(format!("Searching contacts for \"{}\"", query)).await;
        let request = self
            .api
            .post(&ctx, &["crm", "v3", "objects", "contacts", "search"])?
            .json(&json!({
                "query": query,
                "limit": limit,
                "properties": CONTACT_PROPERTIES,
            }));
        let body = send_json(request).await?;

        let contacts: Vec<Value> = body
            .get("results")
            .and_then(Value::as_array)
            .map(|results| results.iter().map(flatten_contact).collect())
            .unwrap_or_default();
        let total = body.get("total").and_then(Value::as_u64).unwrap_or(contacts.len() as u64);

        Ok(ToolResult::success_with_message(
            json!({ "contacts": contacts, "total": total }),
            format!("{} matching contact(s)", total),
        ))
    }
}

/// Contact properties with the record id folded in. Non-object properties
/// are dropped.
fn flatten_contact(record: &Value) -> Value {
    let mut contact = match record.get("properties") {
        Some(Value::Object(properties)) => properties.clone(),
        _ => Map::new(),
    };
    contact.insert("id".to_string(), record.get("id").cloned().unwrap_or(Value::Null));
    Value::Object(contact)
}
