//! External capability seams
//!
//! Everything the system consumes but does not own lives behind a trait in
//! this module: the headless browser, the WebRTC video publisher, the
//! log-structured stream bus, the document store, the durable workflow
//! runtime, and the LLM/vision/transcription providers.
//!
//! Each trait has one implementation per deployment environment; the
//! in-memory/mock implementations in [`mock`] are first-class API used by the
//! CLI local mode and by tests.

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::actions::{ClipboardOp, OptionSelector, Point, SpecialKey};
use crate::config::ViewportConfig;
use crate::dom::{BBox, DomSnapshot};
use crate::error::Result;

pub use mock::{
    LocalWorkflowRuntime, MemoryDocStore, MemoryStreamBus, MockBrowserDriver,
    MockBrowserDriverFactory, MockTextLlm, MockTranscriber, MockVideoPublisher,
    MockVideoPublisherFactory, MockVisionLlm,
};

// =============================================================================
// BROWSER DRIVER
// =============================================================================

/// A resolved action target handed to the driver: either a valid index into
/// the driver's current DOM or a viewport coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedTarget {
    Index(usize),
    Coord(Point),
}

/// Mouse button at the driver boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverButton {
    Left,
    Right,
    Middle,
}

/// Media element command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MediaCommand {
    Play,
    Pause,
    /// Seek to a position in seconds; drivers clamp to [0, duration]
    Seek(f64),
    /// Volume in [0, 1]
    Volume(f64),
    ToggleFullscreen,
    ToggleMute,
}

/// Page zoom command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomCommand {
    In,
    Out,
    Reset,
}

/// Best-effort presentation overlay command.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayCommand {
    HighlightElement { index: usize, color: Option<String> },
    HighlightRegion { region: BBox, color: Option<String> },
    Draw { points: Vec<Point>, color: Option<String> },
    Pointer { enabled: bool },
    Presentation { enabled: bool },
}

/// The headless browser seam. One instance per session; a session owns its
/// driver exclusively until close.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str, new_tab: bool) -> Result<()>;
    async fn back(&self) -> Result<()>;
    async fn forward(&self) -> Result<()>;
    async fn refresh(&self) -> Result<()>;
    async fn current_url(&self) -> Result<String>;

    /// Capture an index-addressed snapshot of the current page.
    async fn snapshot(&self) -> Result<DomSnapshot>;

    async fn click(&self, target: ResolvedTarget, button: DriverButton, clicks: u32) -> Result<()>;
    async fn hover(&self, target: ResolvedTarget) -> Result<()>;

    /// Type text into the element at `index`, or the focused element when
    /// `index` is `None`. `per_char_delay_ms` selects per-character emission.
    async fn type_text(&self, index: Option<usize>, text: &str, per_char_delay_ms: Option<u64>) -> Result<()>;
    async fn clear(&self, index: Option<usize>) -> Result<()>;
    async fn press_keys(&self, keys: &[SpecialKey], index: Option<usize>) -> Result<()>;
    async fn shortcut(&self, keys: &str, index: Option<usize>) -> Result<()>;
    async fn clipboard(&self, op: ClipboardOp, index: Option<usize>) -> Result<Option<String>>;

    async fn scroll_by(&self, dx: f64, dy: f64, duration_ms: Option<u64>) -> Result<()>;
    async fn select_option(&self, index: usize, option: &OptionSelector) -> Result<()>;
    async fn select_values(&self, index: usize, values: &[String]) -> Result<()>;
    async fn multi_select(&self, indices: &[usize]) -> Result<()>;
    async fn set_file_input(&self, index: Option<usize>, path: &str) -> Result<()>;
    async fn drag(&self, start: Point, end: Point) -> Result<()>;
    async fn submit_form(&self, index: Option<usize>) -> Result<()>;
    async fn reset_form(&self, index: Option<usize>) -> Result<()>;
    async fn focus(&self, index: usize) -> Result<()>;

    async fn media(&self, index: Option<usize>, command: MediaCommand) -> Result<()>;
    async fn zoom(&self, command: ZoomCommand) -> Result<()>;
    async fn overlay(&self, command: OverlayCommand) -> Result<()>;

    /// Download a file by URL or by link element; returns an opaque reference.
    async fn download(&self, url: Option<&str>, index: Option<usize>) -> Result<String>;

    /// Capture a screenshot; returns an opaque reference, never inline bytes.
    async fn screenshot(&self) -> Result<String>;

    async fn is_alive(&self) -> bool;
    async fn close(&self) -> Result<()>;
}

/// Creates drivers, one per session.
#[async_trait]
pub trait BrowserDriverFactory: Send + Sync {
    async fn create(&self, viewport: &ViewportConfig) -> Result<Arc<dyn BrowserDriver>>;
}

// =============================================================================
// VIDEO PUBLISHER
// =============================================================================

/// The WebRTC video seam. Frame encoding and the participant wire protocol
/// live behind this trait.
#[async_trait]
pub trait VideoPublisher: Send + Sync {
    async fn start_track(&self, room_name: &str, identity: &str, viewport: &ViewportConfig) -> Result<()>;
    async fn stop_track(&self) -> Result<()>;
    async fn publish_frame(&self, frame: &[u8]) -> Result<()>;
    async fn leave(&self) -> Result<()>;
    async fn is_publishing(&self) -> bool;
}

/// Creates video publishers, one per session.
#[async_trait]
pub trait VideoPublisherFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn VideoPublisher>>;
}

// =============================================================================
// STREAM BUS
// =============================================================================

/// One entry in a log-structured stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Monotone entry id within the stream
    pub id: u64,
    pub payload: serde_json::Value,
    /// Append time in ms since epoch
    pub appended_at_ms: u64,
}

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: serde_json::Value,
    pub published_at_ms: u64,
}

/// The log-structured stream + pub/sub seam.
///
/// Streams (`append`/`read_group`/`ack`/`claim_idle`) carry the ordered
/// command and state logs; channels (`publish`/`subscribe`) carry the
/// low-latency event fan-out. They are logically separate surfaces that one
/// backend may serve.
#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Append an entry, trimming the stream to `max_len`.
    async fn append(&self, stream: &str, payload: serde_json::Value, max_len: usize) -> Result<u64>;

    /// Blocking group read of the next undelivered entry. Delivered entries
    /// become pending for the group until acknowledged.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
    ) -> Result<Option<StreamEntry>>;

    /// Acknowledge a pending entry.
    async fn ack(&self, stream: &str, group: &str, entry_id: u64) -> Result<()>;

    /// Claim pending entries idle for at least `min_idle_ms`, reassigning
    /// them to `consumer`.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<StreamEntry>>;

    /// Number of entries currently in a stream.
    async fn stream_len(&self, stream: &str) -> Result<usize>;

    /// Publish to a channel; returns the number of receivers.
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<usize>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> Result<tokio::sync::broadcast::Receiver<ChannelMessage>>;
}

// =============================================================================
// DOCUMENT STORE
// =============================================================================

/// The document store seam. Collections are schemaless JSON documents indexed
/// by primary key and by `knowledge_id`.
#[async_trait]
pub trait DocStore: Send + Sync {
    async fn upsert(&self, collection: &str, id: &str, doc: serde_json::Value) -> Result<()>;
    async fn get(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>>;
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Full slice of a collection for one knowledge id.
    async fn find_by_knowledge_id(
        &self,
        collection: &str,
        knowledge_id: &str,
    ) -> Result<Vec<serde_json::Value>>;

    /// Bulk delete for replace-by-id semantics; returns the number removed.
    async fn delete_by_knowledge_id(&self, collection: &str, knowledge_id: &str) -> Result<u64>;

    async fn count(&self, collection: &str) -> Result<usize>;
}

// =============================================================================
// WORKFLOW RUNTIME
// =============================================================================

/// Checkpoint written by an activity every N processed items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityCheckpoint {
    pub activity_name: String,
    pub items_processed: usize,
    pub last_item_id: Option<String>,
}

/// Control signal delivered to a running workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowSignal {
    Pause,
    Resume,
    Cancel,
}

/// The durable workflow runtime seam: idempotent activity results,
/// checkpoints, heartbeats, and control signals. Orchestration order lives in
/// the workflow module; durability lives behind this trait.
#[async_trait]
pub trait WorkflowRuntime: Send + Sync {
    /// Cached result for an idempotency key, if the activity already ran.
    async fn cached_result(&self, idempotency_key: &str) -> Result<Option<serde_json::Value>>;

    /// Record an activity result under its idempotency key (30-day log).
    async fn store_result(&self, idempotency_key: &str, result: &serde_json::Value) -> Result<()>;

    async fn load_checkpoint(&self, run_id: &str, activity: &str) -> Result<Option<ActivityCheckpoint>>;
    async fn save_checkpoint(&self, run_id: &str, activity: &str, checkpoint: &ActivityCheckpoint) -> Result<()>;

    /// Heartbeat while an activity processes items.
    async fn heartbeat(&self, run_id: &str, activity: &str) -> Result<()>;

    /// Deliver a control signal to a run.
    async fn send_signal(&self, run_id: &str, signal: WorkflowSignal) -> Result<()>;

    /// Poll the most recent undelivered signal for a run.
    async fn poll_signal(&self, run_id: &str) -> Result<Option<WorkflowSignal>>;
}

// =============================================================================
// LLM / VISION / TRANSCRIPTION
// =============================================================================

/// Text-completion seam used by the business-level extractors.
#[async_trait]
pub trait TextLlm: Send + Sync {
    /// Complete a prompt; implementations return raw model text.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;

    /// Get the model name
    fn model(&self) -> &str;
}

/// Vision seam for frame captioning during video ingestion.
#[async_trait]
pub trait VisionLlm: Send + Sync {
    async fn caption(&self, frame: &[u8], prompt: &str) -> Result<String>;
}

/// One segment of a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

/// A full transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    /// Concatenated transcript text
    pub fn full_text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join(" ")
    }
}

/// Audio/video transcription seam.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, media_url: &str) -> Result<Transcript>;
}
