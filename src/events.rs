use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Progress events emitted while a gated tool runs.
///
/// A successful call emits `Starting`, zero or more `Processing`, then
/// `Complete`. A failed call ends in `Error` instead. Calls short-circuited
/// by a missing connection emit no tool events at all; the turn carries a
/// connection-required part instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolEvent {
    Starting {
        tool: String,
        call_id: String,
        #[serde(with = "millis::timestamp")]
        timestamp: SystemTime,
    },

    /// Intermediate progress (optional percent 0-100)
    Processing {
        tool: String,
        call_id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f32>,
        #[serde(with = "millis::timestamp")]
        timestamp: SystemTime,
    },

    Complete {
        tool: String,
        call_id: String,
        #[serde(with = "millis::duration")]
        duration: Duration,
        #[serde(with = "millis::timestamp")]
        timestamp: SystemTime,
    },

    Error {
        tool: String,
        call_id: String,
        error: String,
        /// Whether retrying the same call later may succeed
        recoverable: bool,
        #[serde(with = "millis::timestamp")]
        timestamp: SystemTime,
    },
}

impl ToolEvent {
    pub fn starting(tool: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self::Starting {
            tool: tool.into(),
            call_id: call_id.into(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn processing(
        tool: impl Into<String>,
        call_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Processing {
            tool: tool.into(),
            call_id: call_id.into(),
            message: message.into(),
            percent: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn processing_with_percent(
        tool: impl Into<String>,
        call_id: impl Into<String>,
        message: impl Into<String>,
        percent: f32,
    ) -> Self {
        Self::Processing {
            tool: tool.into(),
            call_id: call_id.into(),
            message: message.into(),
            percent: Some(percent.clamp(0.0, 100.0)),
            timestamp: SystemTime::now(),
        }
    }

    pub fn complete(tool: impl Into<String>, call_id: impl Into<String>, duration: Duration) -> Self {
        Self::Complete {
            tool: tool.into(),
            call_id: call_id.into(),
            duration,
            timestamp: SystemTime::now(),
        }
    }

    pub fn error(
        tool: impl Into<String>,
        call_id: impl Into<String>,
        error: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self::Error {
            tool: tool.into(),
            call_id: call_id.into(),
            error: error.into(),
            recoverable,
            timestamp: SystemTime::now(),
        }
    }

    pub fn tool(&self) -> &str {
        match self {
            Self::Starting { tool, .. } => tool,
            Self::Processing { tool, .. } => tool,
            Self::Complete { tool, .. } => tool,
            Self::Error { tool, .. } => tool,
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            Self::Starting { call_id, .. } => call_id,
            Self::Processing { call_id, .. } => call_id,
            Self::Complete { call_id, .. } => call_id,
            Self::Error { call_id, .. } => call_id,
        }
    }

    /// Get the event status as a string (for testing assertions)
    pub fn status(&self) -> &'static str {
        match self {
            Self::Starting { .. } => "starting",
            Self::Processing { .. } => "processing",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// Timestamps and durations travel as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub mod timestamp {
        use super::*;

        pub fn serialize<S: Serializer>(time: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
            let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
            super::duration::serialize(&since_epoch, s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
            Ok(crate::identity::millis_to_system_time(u64::deserialize(d)?))
        }
    }

    pub mod duration {
        use super::*;

        pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
            u64::deserialize(d).map(Duration::from_millis)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_percent_clamped() {
        let high = ToolEvent::processing_with_percent("t", "c", "msg", 150.0);
        let low = ToolEvent::processing_with_percent("t", "c", "msg", -10.0);

        assert!(matches!(high, ToolEvent::Processing { percent: Some(p), .. } if p == 100.0));
        assert!(matches!(low, ToolEvent::Processing { percent: Some(p), .. } if p == 0.0));
    }

    #[test]
    fn test_accessors() {
        let events = vec![
            ToolEvent::starting("a", "1"),
            ToolEvent::processing("b", "2", "working"),
            ToolEvent::complete("c", "3", Duration::from_secs(1)),
            ToolEvent::error("d", "4", "boom", false),
        ];

        let tools: Vec<&str> = events.iter().map(|e| e.tool()).collect();
        let statuses: Vec<&str> = events.iter().map(|e| e.status()).collect();
        assert_eq!(tools, vec!["a", "b", "c", "d"]);
        assert_eq!(statuses, vec!["starting", "processing", "complete", "error"]);
        assert_eq!(events[1].call_id(), "2");
    }

    #[test]
    fn test_terminal_events() {
        assert!(!ToolEvent::starting("t", "c").is_terminal());
        assert!(!ToolEvent::processing("t", "c", "m").is_terminal());
        assert!(ToolEvent::complete("t", "c", Duration::ZERO).is_terminal());
        assert!(ToolEvent::error("t", "c", "e", true).is_terminal());
    }

    #[test]
    fn test_complete_event_serialization() {
        let event = ToolEvent::complete("calendar_list_events", "call-1", Duration::from_millis(1500));
        let serialized = serde_json::to_string(&event).unwrap();

        assert!(serialized.contains("\"status\":\"complete\""));
        assert!(serialized.contains("\"duration\":1500"));
        assert!(serialized.contains("\"call_id\":\"call-1\""));
    }

    #[test]
    fn test_error_event_serialization() {
        let event = ToolEvent::error("slack_post_message", "call-2", "rate limited", true);
        let serialized = serde_json::to_string(&event).unwrap();

        assert!(serialized.contains("\"status\":\"error\""));
        assert!(serialized.contains("\"recoverable\":true"));
    }
}
