//! Sequenced Communication Core
//!
//! Ordered, per-session command/state-update transport:
//! - `ActionEnvelope` / `StateUpdate` - Versioned wire envelopes
//! - `SequenceTracker` - Per-session contiguous sequence validation
//! - `DedupCache` - Command-id idempotency with TTL
//! - `StatePublisher` - Appends state updates to `state:{room_name}`
//! - `CommandConsumer` - Per-session consumer-group reader
//!
//! Within one session the command stream is a single totally-ordered log;
//! consumer-group semantics deliver each message to exactly one consumer, and
//! sequence validation is defense-in-depth on top.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::actions::ActionRequest;
use crate::bus::{BrowserEvent, EventPublisher};
use crate::capabilities::{StreamBus, StreamEntry};
use crate::config::StreamConfig;
use crate::diff::StateDiff;
use crate::error::{Error, ErrorBody, ErrorCode, Result};
use crate::now_ms;
use crate::session::SessionManager;

// =============================================================================
// PROTOCOL VERSION
// =============================================================================

/// Wire protocol version carried on every envelope.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Envelope versions are compatible when their semver majors match.
pub fn version_compatible(version: &str) -> bool {
    let major = |v: &str| v.split('.').next().unwrap_or("").to_string();
    major(version) == major(PROTOCOL_VERSION)
}

// =============================================================================
// STREAM KEYS
// =============================================================================

/// Command stream for a session
pub fn command_stream_key(room_name: &str) -> String {
    format!("commands:{}", room_name)
}

/// State stream for a session
pub fn state_stream_key(room_name: &str) -> String {
    format!("state:{}", room_name)
}

// =============================================================================
// ENVELOPES
// =============================================================================

/// A command addressed to one session, consumed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub version: String,
    /// Opaque unique token for correlation and idempotency
    pub command_id: String,
    pub room_name: String,
    /// Monotone per-session sequence number, starting at 1
    pub sequence_number: u64,
    #[serde(flatten)]
    pub action: ActionRequest,
    pub timeout_ms: u64,
    pub issued_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<HashMap<String, String>>,
}

impl ActionEnvelope {
    /// Create an envelope with a fresh command id
    pub fn new(room_name: impl Into<String>, sequence_number: u64, action: ActionRequest) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            command_id: uuid::Uuid::new_v4().to_string(),
            room_name: room_name.into(),
            sequence_number,
            action,
            timeout_ms: 30_000,
            issued_at_ms: now_ms(),
            trace_context: None,
        }
    }

    /// Set the command id (duplicate-delivery testing and upstream ids)
    pub fn command_id(mut self, id: impl Into<String>) -> Self {
        self.command_id = id.into();
        self
    }

    /// Set the timeout
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Attach a trace-context entry
    pub fn trace(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.trace_context
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Boundary validation: version compatibility plus action params.
    pub fn validate(&self) -> Result<()> {
        if !version_compatible(&self.version) {
            return Err(Error::validation(
                ErrorCode::MalformedEnvelope,
                format!("incompatible version {}", self.version),
            ));
        }
        if self.room_name.is_empty() {
            return Err(Error::validation(ErrorCode::MalformedEnvelope, "empty room_name"));
        }
        if self.command_id.is_empty() {
            return Err(Error::validation(ErrorCode::MalformedEnvelope, "empty command_id"));
        }
        self.action.validate()
    }
}

/// Best-effort effects observed while executing an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedEffects {
    /// New URL when the action caused navigation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation: Option<String>,
    #[serde(default)]
    pub visibility_changed: bool,
    #[serde(default)]
    pub form_fields_changed: bool,
    /// Handler-specific payload (screenshot reference, clipboard text, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Outcome of one dispatched action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub duration_ms: u64,
    #[serde(default)]
    pub observed_effects: ObservedEffects,
}

impl ActionResult {
    /// Successful result
    pub fn ok(duration_ms: u64, observed_effects: ObservedEffects) -> Self {
        Self { success: true, error: None, duration_ms, observed_effects }
    }

    /// Failed result
    pub fn failed(duration_ms: u64, error: ErrorBody) -> Self {
        Self {
            success: false,
            error: Some(error),
            duration_ms,
            observed_effects: ObservedEffects::default(),
        }
    }
}

/// Condensed page state carried on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSummary {
    pub url: String,
    pub title: String,
    pub post_hash: String,
}

/// Per-action state update appended to `state:{room_name}`. Carries the same
/// `command_id` and `sequence_number` as the command for correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub version: String,
    pub update_id: String,
    pub session_id: String,
    pub sequence_number: u64,
    pub command_id: String,
    pub action_result: ActionResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_diff: Option<StateDiff>,
    pub current_state_summary: StateSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,
    pub emitted_at_ms: u64,
}

impl StateUpdate {
    /// Build an update correlated to an envelope
    pub fn for_command(
        envelope: &ActionEnvelope,
        action_result: ActionResult,
        state_diff: Option<StateDiff>,
        summary: StateSummary,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            update_id: uuid::Uuid::new_v4().to_string(),
            session_id: envelope.room_name.clone(),
            sequence_number: envelope.sequence_number,
            command_id: envelope.command_id.clone(),
            action_result,
            state_diff,
            current_state_summary: summary,
            screenshot_ref: None,
            emitted_at_ms: now_ms(),
        }
    }
}

// =============================================================================
// SEQUENCE TRACKER
// =============================================================================

/// Result of validating an incoming sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    InOrder,
    /// Already processed; ack and skip
    Duplicate,
    /// Messages were skipped; request retransmission
    Gap { expected: u64 },
}

/// Tracks the last processed sequence number for one session.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_processed: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expected next sequence number
    pub fn expected(&self) -> u64 {
        self.last_processed + 1
    }

    /// Last processed sequence number
    pub fn last_processed(&self) -> u64 {
        self.last_processed
    }

    /// Validate an incoming sequence number.
    pub fn check(&self, sequence_number: u64) -> SequenceCheck {
        let expected = self.expected();
        if sequence_number == expected {
            SequenceCheck::InOrder
        } else if sequence_number < expected {
            SequenceCheck::Duplicate
        } else {
            SequenceCheck::Gap { expected }
        }
    }

    /// Record a processed sequence number.
    pub fn advance(&mut self, sequence_number: u64) {
        self.last_processed = sequence_number;
    }
}

// =============================================================================
// DEDUP CACHE
// =============================================================================

/// Processing status of a command id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStatus {
    Processing,
    Processed,
}

#[derive(Debug, Clone)]
struct DedupEntry {
    status: DedupStatus,
    expires_at_ms: u64,
}

/// Decision for an incoming command id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    /// Not seen within the TTL; now marked processing
    Fresh,
    /// A twin consumer is processing it right now
    InFlight,
    /// Already processed within the TTL
    AlreadyProcessed,
}

/// Per-session command-id cache with TTL.
#[derive(Debug)]
pub struct DedupCache {
    entries: HashMap<String, DedupEntry>,
    ttl_ms: u64,
}

impl DedupCache {
    /// Create a cache with the given TTL
    pub fn new(ttl_ms: u64) -> Self {
        Self { entries: HashMap::new(), ttl_ms }
    }

    fn purge(&mut self) {
        let now = now_ms();
        self.entries.retain(|_, e| e.expires_at_ms > now);
    }

    /// Classify a command id, marking fresh ids as processing.
    pub fn begin(&mut self, command_id: &str) -> DedupDecision {
        self.purge();
        match self.entries.get(command_id).map(|e| e.status) {
            Some(DedupStatus::Processed) => DedupDecision::AlreadyProcessed,
            Some(DedupStatus::Processing) => DedupDecision::InFlight,
            None => {
                self.entries.insert(
                    command_id.to_string(),
                    DedupEntry { status: DedupStatus::Processing, expires_at_ms: now_ms() + self.ttl_ms },
                );
                DedupDecision::Fresh
            }
        }
    }

    /// Mark a command processed, refreshing its TTL.
    pub fn mark_processed(&mut self, command_id: &str) {
        self.entries.insert(
            command_id.to_string(),
            DedupEntry { status: DedupStatus::Processed, expires_at_ms: now_ms() + self.ttl_ms },
        );
    }

    /// Forget a command (transient failure: allow redelivery to re-execute).
    pub fn forget(&mut self, command_id: &str) {
        self.entries.remove(command_id);
    }

    /// Number of live entries
    pub fn len(&mut self) -> usize {
        self.purge();
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// STATE PUBLISHER
// =============================================================================

/// Appends state updates to a session's state stream.
pub struct StatePublisher {
    bus: Arc<dyn StreamBus>,
    config: StreamConfig,
}

impl StatePublisher {
    pub fn new(bus: Arc<dyn StreamBus>, config: StreamConfig) -> Self {
        Self { bus, config }
    }

    /// Synchronous append; returns the stream entry id.
    pub async fn publish(&self, update: &StateUpdate) -> Result<u64> {
        let stream = state_stream_key(&update.session_id);
        let payload = serde_json::to_value(update)?;
        let id = self.bus.append(&stream, payload, self.config.max_len).await?;
        debug!(
            session = %update.session_id,
            seq = update.sequence_number,
            command = %update.command_id,
            "state update published"
        );
        Ok(id)
    }
}

// =============================================================================
// PROCESS OUTCOME
// =============================================================================

/// Outcome of routing one envelope through a session, driving the consumer's
/// ack decision.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Executed (success or permanent failure); state update published; ack
    Completed(StateUpdate),
    /// Transient failure after internal retry; leave un-acked for claim
    TransientFailure(ErrorBody),
    /// Duplicate command or sequence; ack silently
    Duplicate,
    /// A twin consumer is processing this command; skip without ack
    InFlight,
    /// Sequence gap; event emitted; leave un-acked
    Gap { expected: u64, got: u64 },
}

// =============================================================================
// COMMAND CONSUMER
// =============================================================================

/// Per-session consumer in the shared command consumer group.
///
/// One consumer task runs per session per instance; group exclusivity across
/// instances plus the session mutex give per-session total order.
pub struct CommandConsumer {
    room_name: String,
    consumer_name: String,
    bus: Arc<dyn StreamBus>,
    manager: Arc<SessionManager>,
    events: Arc<EventPublisher>,
    config: StreamConfig,
}

impl CommandConsumer {
    pub fn new(
        room_name: impl Into<String>,
        bus: Arc<dyn StreamBus>,
        manager: Arc<SessionManager>,
        events: Arc<EventPublisher>,
        config: StreamConfig,
    ) -> Self {
        let room_name = room_name.into();
        Self {
            consumer_name: format!("consumer-{}-{}", room_name, uuid::Uuid::new_v4()),
            room_name,
            bus,
            manager,
            events,
            config,
        }
    }

    /// Consumer loop. Exits when `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let stream = command_stream_key(&self.room_name);
        let group = self.config.command_group.clone();
        info!(room = %self.room_name, consumer = %self.consumer_name, "command consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Re-deliver pending entries first (sequence-gap retries, crashed
            // twin consumers) so they complete in entry order before new reads.
            match self
                .bus
                .claim_idle(&stream, &group, &self.consumer_name, self.config.claim_idle_secs * 1000)
                .await
            {
                Ok(mut claimed) => {
                    claimed.sort_by_key(|e| e.id);
                    for entry in claimed {
                        self.process_entry(entry).await;
                    }
                }
                Err(e) => warn!(room = %self.room_name, error = %e, "claim failed"),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                read = self.bus.read_group(&stream, &group, &self.consumer_name, self.config.block_ms) => {
                    match read {
                        Ok(Some(entry)) => self.process_entry(entry).await,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(room = %self.room_name, error = %e, "stream read failed");
                            tokio::time::sleep(std::time::Duration::from_millis(self.config.block_ms)).await;
                        }
                    }
                }
            }
        }
        info!(room = %self.room_name, "command consumer stopped");
    }

    /// Handle one stream entry through parse, dedup, sequencing, and dispatch.
    pub async fn process_entry(&self, entry: StreamEntry) {
        let stream = command_stream_key(&self.room_name);
        let group = &self.config.command_group;

        let envelope: ActionEnvelope = match serde_json::from_value(entry.payload.clone()) {
            Ok(env) => env,
            Err(e) => {
                // Malformed: ack so it never redelivers, then tell the agent.
                let _ = self.bus.ack(&stream, group, entry.id).await;
                let error = Error::validation(
                    ErrorCode::MalformedEnvelope,
                    format!("unparseable envelope: {}", e),
                );
                self.events
                    .publish(BrowserEvent::action_error(&self.room_name, None, &error.to_body()))
                    .await;
                return;
            }
        };

        match self.manager.process_envelope(envelope).await {
            Ok(ProcessOutcome::Completed(_)) | Ok(ProcessOutcome::Duplicate) => {
                let _ = self.bus.ack(&stream, group, entry.id).await;
            }
            Ok(ProcessOutcome::InFlight) => {
                // A twin holds it; brief pause avoids a hot redelivery loop.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            Ok(ProcessOutcome::TransientFailure(error)) => {
                debug!(room = %self.room_name, code = %error.code, "transient failure, left pending");
            }
            Ok(ProcessOutcome::Gap { expected, got }) => {
                debug!(room = %self.room_name, expected, got, "sequence gap, left pending");
            }
            Err(e) => {
                // Session-level failure (not found, closed): ack and report.
                let _ = self.bus.ack(&stream, group, entry.id).await;
                self.events
                    .publish(BrowserEvent::action_error(&self.room_name, None, &e.to_body()))
                    .await;
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
