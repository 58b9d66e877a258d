//! Google Calendar tools.

use async_trait::async_trait;
use scopegate::{Tool, ToolContext, ToolError, ToolResult};
use serde::Serialize;
use serde_json::{json, Value};

use crate::http::{send_json, ApiClient};

pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";
const DEFAULT_MAX_RESULTS: u64 = 10;

/// `calendar_list_events`: upcoming events on a calendar.
///
/// Arguments: `calendar_id` (default `primary`), `time_min` (RFC 3339),
/// `max_results` (1..=250).
#[derive(Debug, Clone)]
pub struct ListEventsTool {
    api: ApiClient,
}

impl ListEventsTool {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Tool for ListEventsTool {
    fn name(&self) -> &str {
        "calendar_list_events"
    }

    fn description(&self) -> &str {
        "List upcoming events from the user's Google Calendar"
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolResult, ToolError> {
        let calendar_id = ctx
            .arguments
            .get("calendar_id")
            .and_then(Value::as_str)
            .unwrap_or("primary");
        let max_results = ctx
            .arguments
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_RESULTS)
            .clamp(1, 250);

        let mut query = vec![
            ("singleEvents", "true".to_string()),
            ("orderBy", "startTime".to_string()),
            ("maxResults", max_results.to_string()),
        ];
        if let Some(time_min) = ctx.arguments.get("time_min").and_then(Value::as_str) {
            query.push(("timeMin", time_min.to_string()));
        }

        ctx.progress("Fetching calendar events").await;
        let request = self
            .api
            .get(&ctx, &["calendars", calendar_id, "events"])?
            .query(&query);
        let body = send_json(request).await?;

        let events: Vec<Value> = body
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(summarize_event).collect())
            .unwrap_or_default();
        let message = format!("Found {} event(s)", events.len());
        Ok(ToolResult::success_with_message(json!({ "events": events }), message))
    }
}

fn summarize_event(item: &Value) -> Value {
    let time = |field: &str| {
        item.get(field)
            .and_then(|t| t.get("dateTime").or_else(|| t.get("date")))
            .cloned()
            .unwrap_or(Value::Null)
    };
    json!({
        "id": item.get("id").cloned().unwrap_or(Value::Null),
        "summary": item.get("summary").cloned().unwrap_or(Value::Null),
        "start": time("start"),
        "end": time("end"),
    })
}

#[derive(Debug, Serialize)]
struct EventTime<'a> {
    #[serde(rename = "dateTime")]
    date_time: &'a str,
}

#[derive(Debug, Serialize)]
struct NewEvent<'a> {
    summary: &'a str,
    start: EventTime<'a>,
    end: EventTime<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

/// `calendar_create_event`: needs the write scope on top of the read default.
///
/// Arguments: `summary`, `start`, `end` (RFC 3339), optional `description`
/// and `calendar_id`.
#[derive(Debug, Clone)]
pub struct CreateEventTool {
    api: ApiClient,
}

impl CreateEventTool {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Tool for CreateEventTool {
    fn name(&self) -> &str {
        "calendar_create_event"
    }

    fn description(&self) -> &str {
        "Create an event on the user's Google Calendar"
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolResult, ToolError> {
        let event = NewEvent {
            summary: ctx.str_arg("summary")?,
            start: EventTime {
                date_time: ctx.str_arg("start")?,
            },
            end: EventTime {
                date_time: ctx.str_arg("end")?,
            },
            description: ctx.arguments.get("description").and_then(Value::as_str),
        };
        let calendar_id = ctx
            .arguments
            .get("calendar_id")
            .and_then(Value::as_str)
            .unwrap_or("primary");

        ctx.progress("Creating calendar event").await;
        let request = self
            .api
            .post(&ctx, &["calendars", calendar_id, "events"])?
            .json(&event);
        let created = send_json(request).await?;

        let link = created.get("htmlLink").and_then(Value::as_str).unwrap_or_default();
        Ok(ToolResult::success_with_message(
            summarize_event(&created),
            format!("Created \"{}\" {}", event.summary, link).trim_end().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::serve;
    use scopegate::AccessToken;

    fn ctx(tool: &str, arguments: Value) -> ToolContext {
        ToolContext::new("user-1", "call-1", tool, arguments).with_token(AccessToken::new("cal-token"))
    }

    #[tokio::test]
    async fn test_list_events_summarizes_items() {
        let body = json!({
            "items": [
                {"id": "e1", "summary": "Standup", "start": {"dateTime": "2026-10-19T09:00:00Z"}, "end": {"dateTime": "2026-10-19T09:15:00Z"}},
                {"id": "e2", "summary": "Offsite", "start": {"date": "2026-10-20"}, "end": {"date": "2026-10-21"}}
            ]
        });
        let (base, mut requests) = serve(vec![(200, vec![], body.to_string())]).await;
        let tool = ListEventsTool::new(ApiClient::new(reqwest::Client::new(), base));

        let result = tool
            .execute(ctx("calendar_list_events", json!({"max_results": 500})))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output["events"][0]["summary"], "Standup");
        assert_eq!(result.output["events"][1]["start"], "2026-10-20");
        assert_eq!(result.message.as_deref(), Some("Found 2 event(s)"));

        let request = requests.recv().await.unwrap();
        assert!(request.starts_with("GET /calendars/primary/events?"));
        assert!(request.contains("maxResults=250"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer cal-token"));
    }

    #[tokio::test]
    async fn test_calendar_id_is_one_path_segment() {
        let (base, mut requests) = serve(vec![(200, vec![], json!({"items": []}).to_string())]).await;
        let tool = ListEventsTool::new(ApiClient::new(reqwest::Client::new(), base));

        tool.execute(ctx(
            "calendar_list_events",
            json!({"calendar_id": "team@group.calendar.google.com/../../users/me?x=1#frag"}),
        ))
        .await
        .unwrap();

        let request = requests.recv().await.unwrap();
        assert!(request.starts_with(
            "GET /calendars/team@group.calendar.google.com%2F..%2F..%2Fusers%2Fme%3Fx=1%23frag/events?"
        ));
    }

    #[tokio::test]
    async fn test_revoked_token_is_unauthorized() {
        let (base, _) = serve(vec![(401, vec![], "{\"error\":\"invalid_grant\"}".to_string())]).await;
        let tool = ListEventsTool::new(ApiClient::new(reqwest::Client::new(), base));

        let err = tool.execute(ctx("calendar_list_events", json!({}))).await.unwrap_err();
        assert!(matches!(err, ToolError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_create_event_requires_times() {
        let tool = CreateEventTool::new(ApiClient::new(reqwest::Client::new(), "http://127.0.0.1:9"));
        let err = tool
            .execute(ctx("calendar_create_event", json!({"summary": "Lunch"})))
            .await
            .unwrap_err();

        assert_eq!(err, ToolError::InvalidArguments("missing string argument 'start'".to_string()));
    }

    #[tokio::test]
    async fn test_create_event_posts_body() {
        let created = json!({
            "id": "new-1",
            "summary": "Lunch",
            "htmlLink": "https://calendar.google.com/event?eid=new-1",
            "start": {"dateTime": "2026-10-19T12:00:00Z"},
            "end": {"dateTime": "2026-10-19T13:00:00Z"}
        });
        let (base, mut requests) = serve(vec![(200, vec![], created.to_string())]).await;
        let tool = CreateEventTool::new(ApiClient::new(reqwest::Client::new(), base));

        let result = tool
            .execute(ctx(
                "calendar_create_event",
                json!({"summary": "Lunch", "start": "2026-10-19T12:00:00Z", "end": "2026-10-19T13:00:00Z"}),
            ))
            .await
            .unwrap();

        assert_eq!(result.output["id"], "new-1");
        assert!(result.message.unwrap().contains("eid=new-1"));
        let request = requests.recv().await.unwrap();
        assert!(request.starts_with("POST /calendars/primary/events"));
        assert!(request.contains("\"dateTime\":\"2026-10-19T12:00:00Z\""));
    }
}
