//! # Turn Streaming
//!
//! One ordered channel per assistant turn carrying typed parts: text tokens,
//! tool events and results, and connection-required signals. Consumers
//! iterate parts in emission order; nothing is encoded inside the text.
//!
//! ```rust
//! use scopegate::streaming::{turn_channel, PartPayload};
//! use tokio_stream::StreamExt;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let (writer, mut stream) = turn_channel(16);
//! tokio::spawn(async move {
//!     writer.text("Checking your calendar").await.ok();
//!     writer.finish().await.ok();
//! });
//!
//! while let Some(part) = stream.next().await {
//!     if let PartPayload::Text { text } = &part.payload {
//!         print!("{}", text);
//!     }
//! }
//! # });
//! ```

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::directive::{ConnectionRequired, ConnectionRequiredDirective};
use crate::error::{GateError, Result};
use crate::events::ToolEvent;
use crate::tool::ToolResult;

/// Stream of parts for one turn
pub type TurnStream = Pin<Box<dyn Stream<Item = TurnPart> + Send>>;

/// One addressable part of a turn, numbered in emission order from 0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnPart {
    pub seq: u64,
    #[serde(flatten)]
    pub payload: PartPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartPayload {
    Text {
        text: String,
    },

    ToolEvent {
        event: ToolEvent,
    },

    ToolResult {
        tool: String,
        call_id: String,
        result: ToolResult,
    },

    /// Render a connect affordance at this point of the conversation
    ConnectionRequired {
        tool: String,
        call_id: String,
        directive: ConnectionRequiredDirective,
    },

    /// Last part of every complete turn
    Finished,
}

impl PartPayload {
    /// Get the part type as a string (for testing assertions)
    pub fn part_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ToolEvent { .. } => "tool_event",
            Self::ToolResult { .. } => "tool_result",
            Self::ConnectionRequired { .. } => "connection_required",
            Self::Finished => "finished",
        }
    }
}

/// Writing half of a turn channel. Clones share one sequence counter.
#[derive(Clone)]
pub struct TurnWriter {
    tx: mpsc::Sender<TurnPart>,
    /// `None` once the turn is finished
    next_seq: Arc<Mutex<Option<u64>>>,
}

impl std::fmt::Debug for TurnWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnWriter")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Open a turn channel with the given buffer capacity.
pub fn turn_channel(capacity: usize) -> (TurnWriter, TurnStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let writer = TurnWriter {
        tx,
        next_seq: Arc::new(Mutex::new(Some(0))),
    };
    (writer, Box::pin(ReceiverStream::new(rx)))
}

impl TurnWriter {
    /// Append a part. The sequence lock is held across the send so that
    /// sequence numbers always match delivery order.
    pub async fn emit(&self, payload: PartPayload) -> Result<u64> {
        let mut next_seq = self.next_seq.lock().await;
        let seq = (*next_seq)
            .ok_or_else(|| GateError::StreamError("turn already finished".to_string()))?;
        self.tx
            .send(TurnPart { seq, payload })
            .await
            .map_err(|_| GateError::StreamError("turn consumer dropped".to_string()))?;
        *next_seq = Some(seq + 1);
        Ok(seq)
    }

    pub async fn text(&self, text: impl Into<String>) -> Result<u64> {
        self.emit(PartPayload::Text { text: text.into() }).await
    }

    pub async fn tool_event(&self, event: ToolEvent) -> Result<u64> {
        self.emit(PartPayload::ToolEvent { event }).await
    }

    pub async fn tool_result(
        &self,
        tool: impl Into<String>,
        call_id: impl Into<String>,
        result: ToolResult,
    ) -> Result<u64> {
        self.emit(PartPayload::ToolResult {
            tool: tool.into(),
            call_id: call_id.into(),
            result,
        })
        .await
    }

    pub async fn connection_required(
        &self,
        tool: impl Into<String>,
        call_id: impl Into<String>,
        signal: &ConnectionRequired,
    ) -> Result<u64> {
        self.emit(PartPayload::ConnectionRequired {
            tool: tool.into(),
            call_id: call_id.into(),
            directive: signal.to_directive(),
        })
        .await
    }

    /// Close the turn. Clones can no longer append once this returns.
    pub async fn finish(self) -> Result<u64> {
        let seq = self.emit(PartPayload::Finished).await?;
        *self.next_seq.lock().await = None;
        Ok(seq)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Parts seen so far on a recorded stream; replays always start at part 0.
#[derive(Debug, Clone, Default)]
pub struct TurnRecording {
    parts: Arc<StdMutex<Vec<TurnPart>>>,
}

impl TurnRecording {
    /// Wrap a stream so that every part passing through is recorded.
    pub fn record(stream: TurnStream) -> (TurnStream, Self) {
        let recording = Self::default();
        let sink = Arc::clone(&recording.parts);
        let tapped = stream.map(move |part| {
            if let Ok(mut parts) = sink.lock() {
                parts.push(part.clone());
            }
            part
        });
        (Box::pin(tapped), recording)
    }

    /// Drain a stream to completion and keep every part.
    pub async fn collect(mut stream: TurnStream) -> Self {
        let recording = Self::default();
        while let Some(part) = stream.next().await {
            if let Ok(mut parts) = recording.parts.lock() {
                parts.push(part);
            }
        }
        recording
    }

    pub fn parts(&self) -> Vec<TurnPart> {
        self.parts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Whether the recorded turn reached its `Finished` part.
    pub fn is_complete(&self) -> bool {
        self.parts()
            .last()
            .is_some_and(|p| matches!(p.payload, PartPayload::Finished))
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts()
            .iter()
            .filter_map(|p| match &p.payload {
                PartPayload::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .concat()
    }

    /// Replay the turn from its first part.
    pub fn replay(&self) -> TurnStream {
        Box::pin(tokio_stream::iter(self.parts()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::RequiredReason;
    use crate::provider::Provider;
    use crate::scopes::ScopeSet;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_parts_arrive_in_order_with_sequence() {
        let (writer, stream) = turn_channel(8);

        tokio::spawn(async move {
            writer.text("Looking ").await.unwrap();
            writer.tool_event(ToolEvent::starting("calendar_list_events", "c1")).await.unwrap();
            writer.text("up.").await.unwrap();
            writer.finish().await.unwrap();
        });

        let recording = TurnRecording::collect(stream).await;
        let parts = recording.parts();

        let seqs: Vec<u64> = parts.iter().map(|p| p.seq).collect();
        let types: Vec<&str> = parts.iter().map(|p| p.payload.part_type()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(types, vec!["text", "tool_event", "text", "finished"]);
        assert_eq!(recording.text(), "Looking up.");
        assert!(recording.is_complete());
    }

    #[tokio::test]
    async fn test_connection_required_part_is_typed() {
        let (writer, stream) = turn_channel(4);
        let signal = ConnectionRequired::new(
            &Provider::new("slack", "Slack"),
            RequiredReason::NotConnected,
            ScopeSet::new(),
            ScopeSet::new(),
        );

        writer.connection_required("slack_post_message", "c1", &signal).await.unwrap();
        writer.finish().await.unwrap();

        let parts = TurnRecording::collect(stream).await.parts();
        match &parts[0].payload {
            PartPayload::ConnectionRequired { tool, directive, .. } => {
                assert_eq!(tool, "slack_post_message");
                assert_eq!(directive, &signal.to_directive());
            }
            other => panic!("Expected ConnectionRequired part, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_required_part_wire_shape() {
        let (writer, stream) = turn_channel(4);
        let calendar = Provider::new("google-calendar", "Google Calendar")
            .with_default_scopes(["calendar.readonly"]);
        let signal = ConnectionRequired::new(
            &calendar,
            RequiredReason::InsufficientScopes,
            crate::scopes::scope_set(["calendar.readonly", "calendar.events"]),
            crate::scopes::scope_set(["calendar.readonly"]),
        );

        writer.connection_required("calendar_create_event", "c7", &signal).await.unwrap();
        writer.finish().await.unwrap();

        let parts = TurnRecording::collect(stream).await.parts();
        let value = serde_json::to_value(&parts[0]).unwrap();
        assert_eq!(value["type"], "connection_required");
        assert_eq!(value["seq"], 0);
        assert_eq!(value["tool"], "calendar_create_event");
        assert_eq!(value["call_id"], "c7");

        let directive = &value["directive"];
        assert_eq!(directive["type"], "connection_required");
        assert_eq!(directive["service"], "google-calendar");
        assert_eq!(directive["requiredScopes"], json!(["calendar.events", "calendar.readonly"]));
        assert_eq!(directive["currentScopes"], json!(["calendar.readonly"]));
        assert_eq!(directive["connectButton"]["text"], "Grant Google Calendar access");
        assert_eq!(directive["connectButton"]["action"], "connect:google-calendar");
        assert!(directive["message"].as_str().unwrap().contains("calendar.events"));

        let decoded: TurnPart = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, parts[0]);
    }

    #[tokio::test]
    async fn test_emit_fails_when_consumer_dropped() {
        let (writer, stream) = turn_channel(1);
        drop(stream);

        let err = writer.text("hello").await.unwrap_err();
        assert!(matches!(err, GateError::StreamError(_)));
        assert!(writer.is_closed());
    }

    #[tokio::test]
    async fn test_clone_cannot_write_after_finish() {
        let (writer, stream) = turn_channel(4);
        let other = writer.clone();

        writer.finish().await.unwrap();
        let err = other.text("late").await.unwrap_err();
        drop(other);

        assert_eq!(err.to_string(), "Turn stream error: turn already finished");
        let parts = TurnRecording::collect(stream).await.parts();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].payload, PartPayload::Finished);
    }

    #[tokio::test]
    async fn test_record_then_replay_from_start() {
        let (writer, stream) = turn_channel(8);
        let (mut tapped, recording) = TurnRecording::record(stream);

        writer.text("a").await.unwrap();
        writer.text("b").await.unwrap();
        writer.finish().await.unwrap();

        let first = tapped.next().await.unwrap();
        assert_eq!(first.seq, 0);
        while tapped.next().await.is_some() {}

        let replayed: Vec<TurnPart> = recording.replay().collect().await;
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].seq, 0);
        assert_eq!(replayed, recording.parts());
    }

    #[test]
    fn test_part_wire_shape() {
        let part = TurnPart {
            seq: 7,
            payload: PartPayload::ToolEvent {
                event: ToolEvent::complete("t", "c", Duration::from_millis(5)),
            },
        };
        let value = serde_json::to_value(&part).unwrap();

        assert_eq!(value["seq"], 7);
        assert_eq!(value["type"], "tool_event");
        assert_eq!(value["event"]["status"], "complete");

        let text = serde_json::to_value(TurnPart {
            seq: 0,
            payload: PartPayload::Text { text: "hi".to_string() },
        })
        .unwrap();
        assert_eq!(text, json!({"seq": 0, "type": "text", "text": "hi"}));
    }
}
