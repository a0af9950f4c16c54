//! In-memory capability implementations
//!
//! Used by the CLI local mode and by tests. `MockBrowserDriver` is
//! scriptable: queue follow-up snapshots and the driver advances to the next
//! one on each mutating action, which is enough to exercise diffing, index
//! remapping, and the end-to-end scenarios without a real browser.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::actions::{ClipboardOp, OptionSelector, Point, SpecialKey};
use crate::config::ViewportConfig;
use crate::dom::{DomElement, DomSnapshot};
use crate::error::{Error, ErrorCode, Result};
use crate::now_ms;

use super::{
    ActivityCheckpoint, BrowserDriver, BrowserDriverFactory, ChannelMessage, DocStore,
    DriverButton, MediaCommand, OverlayCommand, ResolvedTarget, StreamBus, StreamEntry, TextLlm,
    Transcriber, Transcript, VideoPublisher, VideoPublisherFactory, VisionLlm, WorkflowRuntime,
    WorkflowSignal, ZoomCommand,
};

// =============================================================================
// MOCK BROWSER DRIVER
// =============================================================================

struct DriverState {
    current: DomSnapshot,
    /// Snapshots the page advances through on mutating actions
    queue: VecDeque<DomSnapshot>,
    history: Vec<String>,
    history_pos: usize,
    clipboard: String,
    alive: bool,
    calls: Vec<String>,
    fail_queue: VecDeque<Error>,
    downloads: Vec<String>,
    screenshots: usize,
}

/// Scriptable in-memory browser driver.
pub struct MockBrowserDriver {
    state: Mutex<DriverState>,
}

impl Default for MockBrowserDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrowserDriver {
    /// Create a driver showing an empty page
    pub fn new() -> Self {
        let blank = DomSnapshot::from_parts("about:blank", "", Vec::<DomElement>::new());
        Self {
            state: Mutex::new(DriverState {
                history: vec![blank.url.clone()],
                history_pos: 0,
                current: blank,
                queue: VecDeque::new(),
                clipboard: String::new(),
                alive: true,
                calls: Vec::new(),
                fail_queue: VecDeque::new(),
                downloads: Vec::new(),
                screenshots: 0,
            }),
        }
    }

    /// Create a driver showing the given page
    pub fn with_page(page: DomSnapshot) -> Self {
        let driver = Self::new();
        {
            let mut state = driver.state.lock().unwrap();
            state.history = vec![page.url.clone()];
            state.history_pos = 0;
            state.current = page;
        }
        driver
    }

    /// Queue the page the browser shows after the next mutating action
    pub fn queue_page(&self, page: DomSnapshot) {
        self.state.lock().unwrap().queue.push_back(page);
    }

    /// Make the next driver call fail with the given error
    pub fn fail_next(&self, err: Error) {
        self.state.lock().unwrap().fail_queue.push_back(err);
    }

    /// Simulate a driver crash
    pub fn kill(&self) {
        self.state.lock().unwrap().alive = false;
    }

    /// Revive a crashed driver (recovery testing)
    pub fn revive(&self) {
        self.state.lock().unwrap().alive = true;
    }

    /// Call log for assertions
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of screenshots taken
    pub fn screenshot_count(&self) -> usize {
        self.state.lock().unwrap().screenshots
    }

    fn record(&self, call: impl Into<String>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.alive {
            return Err(Error::session(ErrorCode::DriverCrashed, "driver is dead"));
        }
        if let Some(err) = state.fail_queue.pop_front() {
            return Err(err);
        }
        state.calls.push(call.into());
        Ok(())
    }

    fn advance(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(next) = state.queue.pop_front() {
            state.current = next;
        }
    }
}

#[async_trait]
impl BrowserDriver for MockBrowserDriver {
    async fn navigate(&self, url: &str, new_tab: bool) -> Result<()> {
        self.record(format!("navigate:{}:{}", url, new_tab))?;
        let mut state = self.state.lock().unwrap();
        let pos = state.history_pos;
        state.history.truncate(pos + 1);
        state.history.push(url.to_string());
        state.history_pos += 1;
        if let Some(next) = state.queue.pop_front() {
            state.current = next;
        } else {
            let elements = state.current.elements.clone();
            state.current = DomSnapshot::from_parts(url, state.current.title.clone(), elements);
        }
        Ok(())
    }

    async fn back(&self) -> Result<()> {
        self.record("back")?;
        let mut state = self.state.lock().unwrap();
        if state.history_pos > 0 {
            state.history_pos -= 1;
            let url = state.history[state.history_pos].clone();
            let elements = state.current.elements.clone();
            state.current = DomSnapshot::from_parts(url, state.current.title.clone(), elements);
        }
        Ok(())
    }

    async fn forward(&self) -> Result<()> {
        self.record("forward")?;
        let mut state = self.state.lock().unwrap();
        if state.history_pos + 1 < state.history.len() {
            state.history_pos += 1;
            let url = state.history[state.history_pos].clone();
            let elements = state.current.elements.clone();
            state.current = DomSnapshot::from_parts(url, state.current.title.clone(), elements);
        }
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        self.record("refresh")?;
        self.advance();
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().current.url.clone())
    }

    async fn snapshot(&self) -> Result<DomSnapshot> {
        let state = self.state.lock().unwrap();
        if !state.alive {
            return Err(Error::session(ErrorCode::DriverCrashed, "driver is dead"));
        }
        Ok(state.current.clone())
    }

    async fn click(&self, target: ResolvedTarget, _button: DriverButton, clicks: u32) -> Result<()> {
        match target {
            ResolvedTarget::Index(i) => {
                let exists = self.state.lock().unwrap().current.element(i).is_some();
                if !exists {
                    return Err(Error::resolution(
                        ErrorCode::ElementNotFound,
                        format!("no element at index {}", i),
                    ));
                }
                self.record(format!("click:{}:{}", i, clicks))?;
            }
            ResolvedTarget::Coord(p) => {
                self.record(format!("click_at:{},{}:{}", p.x, p.y, clicks))?;
            }
        }
        self.advance();
        Ok(())
    }

    async fn hover(&self, target: ResolvedTarget) -> Result<()> {
        self.record(format!("hover:{:?}", target))
    }

    async fn type_text(&self, index: Option<usize>, text: &str, per_char_delay_ms: Option<u64>) -> Result<()> {
        self.record(format!("type:{:?}:{}:{:?}", index, text, per_char_delay_ms))?;
        self.advance();
        Ok(())
    }

    async fn clear(&self, index: Option<usize>) -> Result<()> {
        self.record(format!("clear:{:?}", index))?;
        self.advance();
        Ok(())
    }

    async fn press_keys(&self, keys: &[SpecialKey], index: Option<usize>) -> Result<()> {
        self.record(format!("press:{:?}:{:?}", keys, index))?;
        self.advance();
        Ok(())
    }

    async fn shortcut(&self, keys: &str, index: Option<usize>) -> Result<()> {
        self.record(format!("shortcut:{}:{:?}", keys, index))?;
        self.advance();
        Ok(())
    }

    async fn clipboard(&self, op: ClipboardOp, index: Option<usize>) -> Result<Option<String>> {
        self.record(format!("clipboard:{:?}:{:?}", op, index))?;
        let mut state = self.state.lock().unwrap();
        match op {
            ClipboardOp::Copy | ClipboardOp::Cut => {
                let text = index
                    .and_then(|i| state.current.element(i))
                    .and_then(|e| e.attributes.value.clone().or_else(|| e.attributes.text.clone()))
                    .unwrap_or_default();
                state.clipboard = text.clone();
                Ok(Some(text))
            }
            ClipboardOp::Paste => Ok(Some(state.clipboard.clone())),
            ClipboardOp::SelectAll => Ok(None),
        }
    }

    async fn scroll_by(&self, dx: f64, dy: f64, duration_ms: Option<u64>) -> Result<()> {
        self.record(format!("scroll:{},{}:{:?}", dx, dy, duration_ms))?;
        let mut state = self.state.lock().unwrap();
        state.current.scroll_x += dx;
        state.current.scroll_y += dy;
        Ok(())
    }

    async fn select_option(&self, index: usize, option: &OptionSelector) -> Result<()> {
        self.record(format!("select:{}:{:?}", index, option))?;
        self.advance();
        Ok(())
    }

    async fn select_values(&self, index: usize, values: &[String]) -> Result<()> {
        self.record(format!("select_values:{}:{:?}", index, values))?;
        self.advance();
        Ok(())
    }

    async fn multi_select(&self, indices: &[usize]) -> Result<()> {
        self.record(format!("multi_select:{:?}", indices))
    }

    async fn set_file_input(&self, index: Option<usize>, path: &str) -> Result<()> {
        if let Some(i) = index {
            let is_file = self
                .state
                .lock()
                .unwrap()
                .current
                .element(i)
                .map(|e| e.attributes.input_type.as_deref() == Some("file"))
                .unwrap_or(false);
            if !is_file {
                return Err(Error::permanent(
                    ErrorCode::FileUploadFailed,
                    format!("element {} is not a file input", i),
                ));
            }
        }
        self.record(format!("upload:{:?}:{}", index, path))?;
        self.advance();
        Ok(())
    }

    async fn drag(&self, start: Point, end: Point) -> Result<()> {
        self.record(format!("drag:{},{}->{},{}", start.x, start.y, end.x, end.y))?;
        self.advance();
        Ok(())
    }

    async fn submit_form(&self, index: Option<usize>) -> Result<()> {
        self.record(format!("submit:{:?}", index))?;
        self.advance();
        Ok(())
    }

    async fn reset_form(&self, index: Option<usize>) -> Result<()> {
        self.record(format!("reset:{:?}", index))?;
        self.advance();
        Ok(())
    }

    async fn focus(&self, index: usize) -> Result<()> {
        self.record(format!("focus:{}", index))
    }

    async fn media(&self, index: Option<usize>, command: MediaCommand) -> Result<()> {
        self.record(format!("media:{:?}:{:?}", index, command))
    }

    async fn zoom(&self, command: ZoomCommand) -> Result<()> {
        self.record(format!("zoom:{:?}", command))
    }

    async fn overlay(&self, command: OverlayCommand) -> Result<()> {
        self.record(format!("overlay:{:?}", command))
    }

    async fn download(&self, url: Option<&str>, index: Option<usize>) -> Result<String> {
        self.record(format!("download:{:?}:{:?}", url, index))?;
        let reference = format!("download-{}", self.state.lock().unwrap().downloads.len());
        self.state.lock().unwrap().downloads.push(reference.clone());
        Ok(reference)
    }

    async fn screenshot(&self) -> Result<String> {
        self.record("screenshot")?;
        let mut state = self.state.lock().unwrap();
        state.screenshots += 1;
        Ok(format!("screenshot-{}", state.screenshots))
    }

    async fn is_alive(&self) -> bool {
        self.state.lock().unwrap().alive
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().alive = false;
        Ok(())
    }
}

/// Factory producing [`MockBrowserDriver`]s; pre-scripted drivers are handed
/// out in order, after which fresh blank drivers are created.
#[derive(Default)]
pub struct MockBrowserDriverFactory {
    scripted: Mutex<VecDeque<Arc<MockBrowserDriver>>>,
    created: Mutex<Vec<Arc<MockBrowserDriver>>>,
}

impl MockBrowserDriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a pre-built driver for the next `create` call
    pub fn script(&self, driver: Arc<MockBrowserDriver>) {
        self.scripted.lock().unwrap().push_back(driver);
    }

    /// The most recently created driver
    pub fn last(&self) -> Option<Arc<MockBrowserDriver>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl BrowserDriverFactory for MockBrowserDriverFactory {
    async fn create(&self, _viewport: &ViewportConfig) -> Result<Arc<dyn BrowserDriver>> {
        let driver = self
            .scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Arc::new(MockBrowserDriver::new()));
        self.created.lock().unwrap().push(driver.clone());
        Ok(driver)
    }
}

// =============================================================================
// MOCK VIDEO PUBLISHER
// =============================================================================

#[derive(Default)]
struct VideoState {
    publishing: bool,
    joined_room: Option<String>,
    frames: usize,
}

/// Records publish calls without any encoding.
#[derive(Default)]
pub struct MockVideoPublisher {
    state: Mutex<VideoState>,
}

impl MockVideoPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_published(&self) -> usize {
        self.state.lock().unwrap().frames
    }

    pub fn joined_room(&self) -> Option<String> {
        self.state.lock().unwrap().joined_room.clone()
    }
}

#[async_trait]
impl VideoPublisher for MockVideoPublisher {
    async fn start_track(&self, room_name: &str, _identity: &str, _viewport: &ViewportConfig) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.publishing = true;
        state.joined_room = Some(room_name.to_string());
        Ok(())
    }

    async fn stop_track(&self) -> Result<()> {
        self.state.lock().unwrap().publishing = false;
        Ok(())
    }

    async fn publish_frame(&self, _frame: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.publishing {
            return Err(Error::transient(
                ErrorCode::DriverTemporarilyUnavailable,
                "track not started",
            ));
        }
        state.frames += 1;
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.publishing = false;
        state.joined_room = None;
        Ok(())
    }

    async fn is_publishing(&self) -> bool {
        self.state.lock().unwrap().publishing
    }
}

/// Factory for [`MockVideoPublisher`]s.
#[derive(Default)]
pub struct MockVideoPublisherFactory {
    created: Mutex<Vec<Arc<MockVideoPublisher>>>,
}

impl MockVideoPublisherFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<Arc<MockVideoPublisher>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl VideoPublisherFactory for MockVideoPublisherFactory {
    async fn create(&self) -> Result<Arc<dyn VideoPublisher>> {
        let publisher = Arc::new(MockVideoPublisher::new());
        self.created.lock().unwrap().push(publisher.clone());
        Ok(publisher)
    }
}

// =============================================================================
// MEMORY STREAM BUS
// =============================================================================

struct StreamState {
    entries: VecDeque<StreamEntry>,
    next_id: u64,
}

struct PendingEntry {
    entry: StreamEntry,
    #[allow(dead_code)]
    consumer: String,
    delivered_at_ms: u64,
}

#[derive(Default)]
struct GroupState {
    /// Next entry id this group has not yet delivered
    cursor: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Default)]
struct BusInner {
    streams: HashMap<String, StreamState>,
    groups: HashMap<(String, String), GroupState>,
    channels: HashMap<String, broadcast::Sender<ChannelMessage>>,
}

/// In-memory [`StreamBus`] with consumer-group pending/claim semantics.
#[derive(Default)]
pub struct MemoryStreamBus {
    inner: Mutex<BusInner>,
    notify: tokio::sync::Notify,
}

impl MemoryStreamBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel_sender(inner: &mut BusInner, channel: &str) -> broadcast::Sender<ChannelMessage> {
        inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl StreamBus for MemoryStreamBus {
    async fn append(&self, stream: &str, payload: serde_json::Value, max_len: usize) -> Result<u64> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let state = inner
                .streams
                .entry(stream.to_string())
                .or_insert_with(|| StreamState { entries: VecDeque::new(), next_id: 1 });
            let id = state.next_id;
            state.next_id += 1;
            state.entries.push_back(StreamEntry { id, payload, appended_at_ms: now_ms() });
            while state.entries.len() > max_len {
                state.entries.pop_front();
            }
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
    ) -> Result<Option<StreamEntry>> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(block_ms);
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                let cursor = inner
                    .groups
                    .get(&(stream.to_string(), group.to_string()))
                    .map(|g| g.cursor)
                    .unwrap_or(0);
                let found = inner
                    .streams
                    .get(stream)
                    .and_then(|s| s.entries.iter().find(|e| e.id >= cursor.max(1)).cloned());
                if let Some(entry) = found {
                    let group_state = inner
                        .groups
                        .entry((stream.to_string(), group.to_string()))
                        .or_default();
                    group_state.cursor = entry.id + 1;
                    group_state.pending.insert(
                        entry.id,
                        PendingEntry {
                            entry: entry.clone(),
                            consumer: consumer.to_string(),
                            delivered_at_ms: now_ms(),
                        },
                    );
                    return Ok(Some(entry));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(group_state) = inner.groups.get_mut(&(stream.to_string(), group.to_string())) {
            group_state.pending.remove(&entry_id);
        }
        Ok(())
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        let mut claimed = Vec::new();
        if let Some(group_state) = inner.groups.get_mut(&(stream.to_string(), group.to_string())) {
            for pending in group_state.pending.values_mut() {
                if now.saturating_sub(pending.delivered_at_ms) >= min_idle_ms {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at_ms = now;
                    claimed.push(pending.entry.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn stream_len(&self, stream: &str) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .streams
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0))
    }

    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<usize> {
        let sender = {
            let mut inner = self.inner.lock().unwrap();
            Self::channel_sender(&mut inner, channel)
        };
        let message = ChannelMessage {
            channel: channel.to_string(),
            payload,
            published_at_ms: now_ms(),
        };
        Ok(sender.send(message).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<ChannelMessage>> {
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::channel_sender(&mut inner, channel).subscribe())
    }
}

// =============================================================================
// MEMORY DOC STORE
// =============================================================================

/// In-memory [`DocStore`] keyed `collection -> id -> document`.
#[derive(Default)]
pub struct MemoryDocStore {
    collections: Mutex<HashMap<String, BTreeMap<String, serde_json::Value>>>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn upsert(&self, collection: &str, id: &str, doc: serde_json::Value) -> Result<()> {
        self.collections
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get_mut(collection)
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn find_by_knowledge_id(
        &self,
        collection: &str,
        knowledge_id: &str,
    ) -> Result<Vec<serde_json::Value>> {
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(collection)
            .map(|c| {
                c.values()
                    .filter(|doc| doc.get("knowledge_id").and_then(|v| v.as_str()) == Some(knowledge_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_by_knowledge_id(&self, collection: &str, knowledge_id: &str) -> Result<u64> {
        let mut collections = self.collections.lock().unwrap();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, doc| doc.get("knowledge_id").and_then(|v| v.as_str()) != Some(knowledge_id));
        Ok((before - docs.len()) as u64)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0))
    }
}

// =============================================================================
// LOCAL WORKFLOW RUNTIME
// =============================================================================

const RESULT_LOG_TTL_MS: u64 = 30 * 24 * 3600 * 1000;

#[derive(Default)]
struct RuntimeState {
    results: HashMap<String, (serde_json::Value, u64)>,
    checkpoints: HashMap<(String, String), ActivityCheckpoint>,
    signals: HashMap<String, VecDeque<WorkflowSignal>>,
    heartbeats: HashMap<(String, String), u64>,
}

/// Runs everything inline, keeping durability state in memory.
#[derive(Default)]
pub struct LocalWorkflowRuntime {
    state: Mutex<RuntimeState>,
}

impl LocalWorkflowRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last heartbeat time for an activity, for liveness assertions
    pub fn last_heartbeat(&self, run_id: &str, activity: &str) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .heartbeats
            .get(&(run_id.to_string(), activity.to_string()))
            .copied()
    }
}

#[async_trait]
impl WorkflowRuntime for LocalWorkflowRuntime {
    async fn cached_result(&self, idempotency_key: &str) -> Result<Option<serde_json::Value>> {
        let mut state = self.state.lock().unwrap();
        let now = now_ms();
        state.results.retain(|_, (_, expires)| *expires > now);
        Ok(state.results.get(idempotency_key).map(|(v, _)| v.clone()))
    }

    async fn store_result(&self, idempotency_key: &str, result: &serde_json::Value) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .results
            .insert(idempotency_key.to_string(), (result.clone(), now_ms() + RESULT_LOG_TTL_MS));
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: &str, activity: &str) -> Result<Option<ActivityCheckpoint>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .get(&(run_id.to_string(), activity.to_string()))
            .cloned())
    }

    async fn save_checkpoint(&self, run_id: &str, activity: &str, checkpoint: &ActivityCheckpoint) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .checkpoints
            .insert((run_id.to_string(), activity.to_string()), checkpoint.clone());
        Ok(())
    }

    async fn heartbeat(&self, run_id: &str, activity: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .heartbeats
            .insert((run_id.to_string(), activity.to_string()), now_ms());
        Ok(())
    }

    async fn send_signal(&self, run_id: &str, signal: WorkflowSignal) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .signals
            .entry(run_id.to_string())
            .or_default()
            .push_back(signal);
        Ok(())
    }

    async fn poll_signal(&self, run_id: &str) -> Result<Option<WorkflowSignal>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .signals
            .get_mut(run_id)
            .and_then(|q| q.pop_front()))
    }
}

// =============================================================================
// MOCK LLM / VISION / TRANSCRIPTION
// =============================================================================

/// Scriptable text-LLM: queued responses are returned in order, falling back
/// to a default. Prompts are recorded for assertions.
pub struct MockTextLlm {
    responses: Mutex<VecDeque<String>>,
    default_response: String,
    prompts: Mutex<Vec<String>>,
}

impl Default for MockTextLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTextLlm {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: "{}".to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Set the fallback response
    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    /// Queue the next response
    pub fn respond(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push_back(response.into());
    }

    /// Prompts seen so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextLlm for MockTextLlm {
    async fn complete(&self, _system: &str, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone()))
    }

    fn model(&self) -> &str {
        "mock-text-llm"
    }
}

/// Vision mock returning a fixed caption.
pub struct MockVisionLlm {
    caption: String,
}

impl Default for MockVisionLlm {
    fn default() -> Self {
        Self { caption: "a web page".to_string() }
    }
}

impl MockVisionLlm {
    pub fn new(caption: impl Into<String>) -> Self {
        Self { caption: caption.into() }
    }
}

#[async_trait]
impl VisionLlm for MockVisionLlm {
    async fn caption(&self, _frame: &[u8], _prompt: &str) -> Result<String> {
        Ok(self.caption.clone())
    }
}

/// Transcriber mock returning a configured transcript.
#[derive(Default)]
pub struct MockTranscriber {
    transcript: Transcript,
}

impl MockTranscriber {
    pub fn new(transcript: Transcript) -> Self {
        Self { transcript }
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _media_url: &str) -> Result<Transcript> {
        Ok(self.transcript.clone())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_driver_advances_on_mutation() {
        let driver = MockBrowserDriver::with_page(DomSnapshot::from_parts(
            "https://example.com",
            "Home",
            vec![DomElement::new("button").text("Go")],
        ));
        driver.queue_page(DomSnapshot::from_parts(
            "https://example.com/next",
            "Next",
            vec![],
        ));

        driver
            .click(ResolvedTarget::Index(0), DriverButton::Left, 1)
            .await
            .unwrap();
        let snap = driver.snapshot().await.unwrap();
        assert_eq!(snap.url, "https://example.com/next");
    }

    #[tokio::test]
    async fn test_mock_driver_dead_after_kill() {
        let driver = MockBrowserDriver::new();
        driver.kill();
        let err = driver.snapshot().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DriverCrashed);
        assert!(!driver.is_alive().await);
    }

    #[tokio::test]
    async fn test_mock_driver_click_missing_element() {
        let driver = MockBrowserDriver::new();
        let err = driver
            .click(ResolvedTarget::Index(7), DriverButton::Left, 1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ElementNotFound);
    }

    #[tokio::test]
    async fn test_stream_bus_group_read_and_ack() {
        let bus = MemoryStreamBus::new();
        bus.append("commands:demo", json!({"n": 1}), 100).await.unwrap();
        bus.append("commands:demo", json!({"n": 2}), 100).await.unwrap();

        let first = bus
            .read_group("commands:demo", "g", "c1", 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload["n"], 1);
        bus.ack("commands:demo", "g", first.id).await.unwrap();

        let second = bus
            .read_group("commands:demo", "g", "c1", 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.payload["n"], 2);
    }

    #[tokio::test]
    async fn test_stream_bus_unacked_claimable() {
        let bus = MemoryStreamBus::new();
        bus.append("s", json!({"n": 1}), 100).await.unwrap();

        let entry = bus.read_group("s", "g", "c1", 10).await.unwrap().unwrap();
        // Not acked: another consumer can claim it after the idle threshold.
        let claimed = bus.claim_idle("s", "g", "c2", 0).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, entry.id);

        bus.ack("s", "g", entry.id).await.unwrap();
        let claimed = bus.claim_idle("s", "g", "c2", 0).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_stream_bus_trims_to_max_len() {
        let bus = MemoryStreamBus::new();
        for i in 0..10 {
            bus.append("s", json!({"n": i}), 5).await.unwrap();
        }
        assert_eq!(bus.stream_len("s").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_stream_bus_pubsub() {
        let bus = MemoryStreamBus::new();
        let mut rx = bus.subscribe("browser:events:demo").await.unwrap();
        let receivers = bus
            .publish("browser:events:demo", json!({"event_type": "action_completed"}))
            .await
            .unwrap();
        assert_eq!(receivers, 1);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload["event_type"], "action_completed");
    }

    #[tokio::test]
    async fn test_doc_store_knowledge_id_filter() {
        let store = MemoryDocStore::new();
        store.upsert("kb_screens", "s1", json!({"knowledge_id": "k1", "name": "a"})).await.unwrap();
        store.upsert("kb_screens", "s2", json!({"knowledge_id": "k2", "name": "b"})).await.unwrap();

        let slice = store.find_by_knowledge_id("kb_screens", "k1").await.unwrap();
        assert_eq!(slice.len(), 1);

        let removed = store.delete_by_knowledge_id("kb_screens", "k1").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count("kb_screens").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_workflow_runtime_idempotency_cache() {
        let runtime = LocalWorkflowRuntime::new();
        assert!(runtime.cached_result("key").await.unwrap().is_none());
        runtime.store_result("key", &json!({"done": true})).await.unwrap();
        assert_eq!(runtime.cached_result("key").await.unwrap().unwrap()["done"], true);
    }

    #[tokio::test]
    async fn test_workflow_runtime_signals_fifo() {
        let runtime = LocalWorkflowRuntime::new();
        runtime.send_signal("run", WorkflowSignal::Pause).await.unwrap();
        runtime.send_signal("run", WorkflowSignal::Resume).await.unwrap();
        assert_eq!(runtime.poll_signal("run").await.unwrap(), Some(WorkflowSignal::Pause));
        assert_eq!(runtime.poll_signal("run").await.unwrap(), Some(WorkflowSignal::Resume));
        assert_eq!(runtime.poll_signal("run").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mock_text_llm_scripted() {
        let llm = MockTextLlm::new().with_default("fallback");
        llm.respond("first");
        assert_eq!(llm.complete("", "p1").await.unwrap(), "first");
        assert_eq!(llm.complete("", "p2").await.unwrap(), "fallback");
        assert_eq!(llm.prompts(), vec!["p1", "p2"]);
    }
}
