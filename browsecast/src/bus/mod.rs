//! Per-session event channels
//!
//! Low-latency pub/sub fan-out to agents: one channel per session
//! (`browser:events:{room_name}`) plus one progress channel per extraction
//! job (`exploration:{job_id}:progress`). Events are carried by the
//! [`StreamBus`] capability; a bounded in-process history is kept for
//! inspection and tests.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::capabilities::StreamBus;
use crate::error::{ErrorBody, Result};
use crate::now_ms;

// =============================================================================
// EVENT TYPES
// =============================================================================

/// Types of events published on a session's event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserEventType {
    PageNavigation,
    PageLoadComplete,
    ActionCompleted,
    ActionError,
    BrowserError,
    SequenceGap,
}

impl std::fmt::Display for BrowserEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PageNavigation => "page_navigation",
            Self::PageLoadComplete => "page_load_complete",
            Self::ActionCompleted => "action_completed",
            Self::ActionError => "action_error",
            Self::BrowserError => "browser_error",
            Self::SequenceGap => "sequence_gap",
        };
        write!(f, "{}", s)
    }
}

/// An event on a session's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserEvent {
    pub event_type: BrowserEventType,
    pub room_name: String,
    /// Event payload
    pub data: serde_json::Value,
    /// Timestamp (Unix millis)
    pub timestamp_ms: u64,
    /// Command id for request/response correlation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl BrowserEvent {
    /// Create a new event
    pub fn new(event_type: BrowserEventType, room_name: impl Into<String>) -> Self {
        Self {
            event_type,
            room_name: room_name.into(),
            data: serde_json::Value::Null,
            timestamp_ms: now_ms(),
            correlation_id: None,
        }
    }

    /// Set event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Set the correlation id
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Create a page-navigation event
    pub fn page_navigation(room: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(BrowserEventType::PageNavigation, room)
            .data(serde_json::json!({"url": url.into()}))
    }

    /// Create a page-load-complete event
    pub fn page_load_complete(room: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(BrowserEventType::PageLoadComplete, room)
            .data(serde_json::json!({"url": url.into()}))
    }

    /// Create an action-completed event
    pub fn action_completed(
        room: impl Into<String>,
        command_id: impl Into<String>,
        action_type: impl Into<String>,
    ) -> Self {
        let command_id = command_id.into();
        Self::new(BrowserEventType::ActionCompleted, room)
            .data(serde_json::json!({"action_type": action_type.into()}))
            .correlation_id(command_id)
    }

    /// Create an action-error event
    pub fn action_error(room: impl Into<String>, command_id: Option<String>, error: &ErrorBody) -> Self {
        let mut event = Self::new(BrowserEventType::ActionError, room)
            .data(serde_json::to_value(error).unwrap_or_default());
        event.correlation_id = command_id;
        event
    }

    /// Create a browser-error event
    pub fn browser_error(room: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BrowserEventType::BrowserError, room)
            .data(serde_json::json!({"message": message.into()}))
    }

    /// Create a sequence-gap event requesting retransmission
    pub fn sequence_gap(room: impl Into<String>, expected: u64, got: u64) -> Self {
        Self::new(BrowserEventType::SequenceGap, room)
            .data(serde_json::json!({"expected": expected, "got": got}))
    }
}

/// Progress event on an extraction job's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub phase: String,
    /// Progress within [0, 100]
    pub progress_pct: f64,
    pub message: String,
    pub timestamp_ms: u64,
}

// =============================================================================
// CHANNEL NAMING
// =============================================================================

/// Channel carrying a session's events
pub fn browser_events_channel(room_name: &str) -> String {
    format!("browser:events:{}", room_name)
}

/// Channel carrying an extraction job's progress
pub fn exploration_progress_channel(job_id: &str) -> String {
    format!("exploration:{}:progress", job_id)
}

// =============================================================================
// EVENT PUBLISHER
// =============================================================================

const DEFAULT_MAX_HISTORY: usize = 1000;

/// Publishes events to per-session channels, keeping a bounded history.
/// Publish failures are logged and swallowed so event fan-out can never fail
/// an action dispatch.
pub struct EventPublisher {
    bus: Arc<dyn StreamBus>,
    history: Mutex<VecDeque<BrowserEvent>>,
    max_history: usize,
}

impl EventPublisher {
    /// Create a publisher over a stream bus
    pub fn new(bus: Arc<dyn StreamBus>) -> Self {
        Self {
            bus,
            history: Mutex::new(VecDeque::new()),
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    /// Create with a custom history bound
    pub fn with_history(bus: Arc<dyn StreamBus>, max_history: usize) -> Self {
        Self {
            bus,
            history: Mutex::new(VecDeque::new()),
            max_history,
        }
    }

    /// Publish an event to its session channel.
    pub async fn publish(&self, event: BrowserEvent) {
        {
            let mut history = self.history.lock().unwrap();
            history.push_back(event.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }
        let channel = browser_events_channel(&event.room_name);
        let payload = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                warn!(room = %event.room_name, error = %e, "failed to serialize event");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&channel, payload).await {
            warn!(room = %event.room_name, error = %e, "event publish failed");
        }
    }

    /// Publish a job progress event.
    pub async fn publish_progress(&self, event: &ProgressEvent) -> Result<()> {
        let channel = exploration_progress_channel(&event.job_id);
        self.bus.publish(&channel, serde_json::to_value(event)?).await?;
        Ok(())
    }

    /// Event history, oldest first
    pub fn history(&self) -> Vec<BrowserEvent> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    /// History entries of a given type
    pub fn events_by_type(&self, event_type: BrowserEventType) -> Vec<BrowserEvent> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// History entries for a room
    pub fn events_by_room(&self, room_name: &str) -> Vec<BrowserEvent> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.room_name == room_name)
            .cloned()
            .collect()
    }

    /// Clear the history
    pub fn clear_history(&self) {
        self.history.lock().unwrap().clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryStreamBus;
    use crate::error::ErrorCode;

    #[test]
    fn test_channel_names() {
        assert_eq!(browser_events_channel("demo"), "browser:events:demo");
        assert_eq!(exploration_progress_channel("job-1"), "exploration:job-1:progress");
    }

    #[test]
    fn test_event_helpers() {
        let event = BrowserEvent::action_completed("demo", "cmd-1", "click");
        assert_eq!(event.event_type, BrowserEventType::ActionCompleted);
        assert_eq!(event.correlation_id.as_deref(), Some("cmd-1"));
        assert_eq!(event.data["action_type"], "click");

        let gap = BrowserEvent::sequence_gap("demo", 3, 4);
        assert_eq!(gap.data["expected"], 3);
        assert_eq!(gap.data["got"], 4);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = Arc::new(MemoryStreamBus::new());
        let publisher = EventPublisher::new(bus.clone());
        let mut rx = bus.subscribe(&browser_events_channel("demo")).await.unwrap();

        publisher
            .publish(BrowserEvent::page_navigation("demo", "https://example.com"))
            .await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload["event_type"], "page_navigation");
    }

    #[tokio::test]
    async fn test_history_bound() {
        let bus = Arc::new(MemoryStreamBus::new());
        let publisher = EventPublisher::with_history(bus, 3);

        for i in 0..5 {
            publisher
                .publish(BrowserEvent::browser_error("demo", format!("err {}", i)))
                .await;
        }

        let history = publisher.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].data["message"], "err 2");
    }

    #[tokio::test]
    async fn test_history_filters() {
        let bus = Arc::new(MemoryStreamBus::new());
        let publisher = EventPublisher::new(bus);

        publisher.publish(BrowserEvent::page_navigation("a", "https://x.test")).await;
        publisher
            .publish(BrowserEvent::action_error(
                "b",
                Some("cmd".into()),
                &crate::error::Error::validation(ErrorCode::InvalidParams, "bad").to_body(),
            ))
            .await;

        assert_eq!(publisher.events_by_type(BrowserEventType::PageNavigation).len(), 1);
        assert_eq!(publisher.events_by_room("b").len(), 1);
    }
}
