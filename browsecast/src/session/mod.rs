//! Session Manager
//!
//! Owns the `room_name -> Session` mapping and the per-session state machine:
//!
//! ```text
//! (none) --start--> Starting --ok--> Active
//!                            --err--> Failed
//! Active --pause--> Paused --resume--> Active
//! Active|Paused --close--> Closed
//! Active|Paused --driver crash--> Failed --recover--> Starting
//! Failed --close--> Closed
//! ```
//!
//! A session exclusively owns its driver and video track; every mutation of
//! driver state happens inside the session's async mutex (the "session
//! mutex"), so per-session dispatch is serialized while sessions proceed in
//! parallel.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::bus::{BrowserEvent, EventPublisher};
use crate::capabilities::{
    BrowserDriver, BrowserDriverFactory, StreamBus, VideoPublisher, VideoPublisherFactory,
};
use crate::config::{ServiceConfig, SessionConfig};
use crate::dispatch::ActionDispatcher;
use crate::dom::{DomSnapshot, FormFieldMatch};
use crate::error::{Error, ErrorCode, Result};
use crate::now_ms;
use crate::stream::{
    ActionEnvelope, ActionResult, CommandConsumer, DedupCache, DedupDecision, ProcessOutcome,
    SequenceCheck, SequenceTracker, StatePublisher, StateSummary, StateUpdate,
};

// =============================================================================
// PHASE & VIEWS
// =============================================================================

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Starting,
    Active,
    Paused,
    Failed,
    Closed,
}

/// Synchronous context view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub room_name: String,
    pub phase: SessionPhase,
    pub url: String,
    pub title: String,
    pub content_hash: String,
    pub element_count: usize,
    pub last_sequence: u64,
    pub actions_executed: u64,
    pub actions_failed: u64,
    pub started_at_ms: u64,
}

/// DOM-derived screen content view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenContent {
    pub url: String,
    pub title: String,
    pub visible_text: String,
    pub element_count: usize,
    pub content_hash: String,
}

// =============================================================================
// SESSION
// =============================================================================

struct SessionInner {
    config: SessionConfig,
    phase: SessionPhase,
    driver: Option<Arc<dyn BrowserDriver>>,
    video: Option<Arc<dyn VideoPublisher>>,
    last_snapshot: Option<Arc<DomSnapshot>>,
    last_url: Option<String>,
    sequence: SequenceTracker,
    dedup: DedupCache,
    started_at_ms: u64,
    actions_executed: u64,
    actions_failed: u64,
}

/// One live browser session. All driver interaction is serialized through the
/// inner mutex.
pub struct Session {
    room_name: String,
    inner: Mutex<SessionInner>,
    shutdown: watch::Sender<bool>,
}

impl Session {
    fn new(config: SessionConfig, dedup_ttl_ms: u64) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            room_name: config.room_name.clone(),
            inner: Mutex::new(SessionInner {
                config,
                phase: SessionPhase::Starting,
                driver: None,
                video: None,
                last_snapshot: None,
                last_url: None,
                sequence: SequenceTracker::new(),
                dedup: DedupCache::new(dedup_ttl_ms),
                started_at_ms: now_ms(),
                actions_executed: 0,
                actions_failed: 0,
            }),
            shutdown,
        }
    }

    /// Room name keying this session
    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    driver_factory: Option<Arc<dyn BrowserDriverFactory>>,
    video_factory: Option<Arc<dyn VideoPublisherFactory>>,
    bus: Option<Arc<dyn StreamBus>>,
    config: ServiceConfig,
}

impl SessionManagerBuilder {
    /// Set the browser driver factory
    pub fn driver_factory(mut self, factory: Arc<dyn BrowserDriverFactory>) -> Self {
        self.driver_factory = Some(factory);
        self
    }

    /// Set the video publisher factory
    pub fn video_factory(mut self, factory: Arc<dyn VideoPublisherFactory>) -> Self {
        self.video_factory = Some(factory);
        self
    }

    /// Set the stream bus
    pub fn bus(mut self, bus: Arc<dyn StreamBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set the service config
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the manager
    pub fn build(self) -> Result<Arc<SessionManager>> {
        let bus = self
            .bus
            .ok_or_else(|| Error::invalid_params("SessionManager requires a stream bus"))?;
        let driver_factory = self
            .driver_factory
            .ok_or_else(|| Error::invalid_params("SessionManager requires a driver factory"))?;
        let video_factory = self
            .video_factory
            .ok_or_else(|| Error::invalid_params("SessionManager requires a video factory"))?;

        let events = Arc::new(EventPublisher::new(bus.clone()));
        let publisher = StatePublisher::new(bus.clone(), self.config.stream.clone());
        Ok(Arc::new(SessionManager {
            sessions: RwLock::new(HashMap::new()),
            driver_factory,
            video_factory,
            bus,
            dispatcher: ActionDispatcher::default(),
            publisher,
            events,
            config: self.config,
        }))
    }
}

/// Lifecycle owner for all sessions in this instance.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    driver_factory: Arc<dyn BrowserDriverFactory>,
    video_factory: Arc<dyn VideoPublisherFactory>,
    bus: Arc<dyn StreamBus>,
    dispatcher: ActionDispatcher,
    publisher: StatePublisher,
    events: Arc<EventPublisher>,
    config: ServiceConfig,
}

impl SessionManager {
    /// Create a builder
    pub fn builder() -> SessionManagerBuilder {
        SessionManagerBuilder {
            driver_factory: None,
            video_factory: None,
            bus: None,
            config: ServiceConfig::default(),
        }
    }

    /// The event publisher (shared with consumers and workflows)
    pub fn events(&self) -> Arc<EventPublisher> {
        self.events.clone()
    }

    /// The stream bus
    pub fn bus(&self) -> Arc<dyn StreamBus> {
        self.bus.clone()
    }

    /// The shared action dispatcher
    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    /// Room names of live sessions
    pub fn rooms(&self) -> Vec<String> {
        self.sessions.read().unwrap().keys().cloned().collect()
    }

    /// Current phase of a session
    pub async fn phase(&self, room_name: &str) -> Option<SessionPhase> {
        let session = self.get(room_name).ok()?;
        let inner = session.inner.lock().await;
        Some(inner.phase)
    }

    fn get(&self, room_name: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .get(room_name)
            .cloned()
            .ok_or_else(|| {
                Error::session(ErrorCode::SessionNotFound, format!("no session for room {}", room_name))
            })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start a session: allocate a driver, join the video room, navigate to
    /// the initial URL, then start the per-session command consumer when
    /// stream mode is on.
    pub async fn start_session(self: &Arc<Self>, config: SessionConfig) -> Result<()> {
        let room_name = config.room_name.clone();
        let session = {
            let mut sessions = self.sessions.write().unwrap();
            if sessions.contains_key(&room_name) {
                return Err(Error::session(
                    ErrorCode::SessionAlreadyExists,
                    format!("session {} already exists", room_name),
                ));
            }
            let session = Arc::new(Session::new(config.clone(), self.config.stream.dedup_ttl_secs * 1000));
            sessions.insert(room_name.clone(), session.clone());
            session
        };

        match self.bring_up(&session, &config).await {
            Ok(()) => {
                info!(room = %room_name, "session active");
                if config.stream_mode {
                    self.spawn_consumer(&session);
                }
                Ok(())
            }
            Err(e) => {
                error!(room = %room_name, error = %e, "session start failed");
                let mut inner = session.inner.lock().await;
                release_resources(&mut inner).await;
                inner.phase = SessionPhase::Failed;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, session: &Arc<Session>, config: &SessionConfig) -> Result<()> {
        let mut inner = session.inner.lock().await;
        inner.phase = SessionPhase::Starting;

        let driver = self.driver_factory.create(&config.viewport).await?;
        inner.driver = Some(driver.clone());

        let video = self.video_factory.create().await?;
        video
            .start_track(&config.room_name, &config.participant_identity, &config.viewport)
            .await?;
        inner.video = Some(video);

        if let Some(url) = &config.initial_url {
            driver.navigate(url, false).await?;
            inner.last_url = Some(url.clone());
        }
        let snapshot = driver.snapshot().await?;
        inner.last_url = Some(snapshot.url.clone());
        inner.last_snapshot = Some(Arc::new(snapshot));
        inner.phase = SessionPhase::Active;
        Ok(())
    }

    fn spawn_consumer(self: &Arc<Self>, session: &Arc<Session>) {
        let consumer = CommandConsumer::new(
            session.room_name.clone(),
            self.bus.clone(),
            self.clone(),
            self.events.clone(),
            self.config.stream.clone(),
        );
        let shutdown = session.shutdown_receiver();
        tokio::spawn(async move {
            consumer.run(shutdown).await;
        });
    }

    /// Pause video publishing without releasing the driver.
    pub async fn pause_session(&self, room_name: &str) -> Result<()> {
        let session = self.get(room_name)?;
        let mut inner = session.inner.lock().await;
        match inner.phase {
            SessionPhase::Active => {
                if let Some(video) = &inner.video {
                    video.stop_track().await?;
                }
                inner.phase = SessionPhase::Paused;
                Ok(())
            }
            phase => Err(Error::session(
                ErrorCode::SessionClosed,
                format!("cannot pause session in phase {:?}", phase),
            )),
        }
    }

    /// Resume video publishing.
    pub async fn resume_session(&self, room_name: &str) -> Result<()> {
        let session = self.get(room_name)?;
        let mut inner = session.inner.lock().await;
        match inner.phase {
            SessionPhase::Paused => {
                let (identity, viewport) =
                    (inner.config.participant_identity.clone(), inner.config.viewport);
                if let Some(video) = &inner.video {
                    video.start_track(room_name, &identity, &viewport).await?;
                }
                inner.phase = SessionPhase::Active;
                Ok(())
            }
            phase => Err(Error::session(
                ErrorCode::SessionClosed,
                format!("cannot resume session in phase {:?}", phase),
            )),
        }
    }

    /// Close a session, releasing every resource on every exit path.
    pub async fn close_session(&self, room_name: &str) -> Result<()> {
        let session = self.get(room_name)?;
        let _ = session.shutdown.send(true);
        {
            let mut inner = session.inner.lock().await;
            release_resources(&mut inner).await;
            inner.phase = SessionPhase::Closed;
        }
        self.sessions.write().unwrap().remove(room_name);
        info!(room = %room_name, "session closed");
        Ok(())
    }

    /// Recover a failed session: recreate the driver when dead, re-join
    /// video, and re-navigate to the last known URL.
    pub async fn recover_session(&self, room_name: &str) -> Result<()> {
        let session = self.get(room_name)?;
        let mut inner = session.inner.lock().await;
        if inner.phase == SessionPhase::Closed {
            return Err(Error::session(ErrorCode::SessionClosed, "session is closed"));
        }
        inner.phase = SessionPhase::Starting;

        let driver_alive = match &inner.driver {
            Some(driver) => driver.is_alive().await,
            None => false,
        };
        if !driver_alive {
            let viewport = inner.config.viewport;
            inner.driver = Some(self.driver_factory.create(&viewport).await?);
        }
        let driver = inner.driver.as_ref().cloned().expect("driver just ensured");

        let (identity, viewport) = (inner.config.participant_identity.clone(), inner.config.viewport);
        let video = match &inner.video {
            Some(video) => video.clone(),
            None => {
                let video = self.video_factory.create().await?;
                inner.video = Some(video.clone());
                video
            }
        };
        video.start_track(room_name, &identity, &viewport).await?;

        if let Some(url) = inner.last_url.clone() {
            driver.navigate(&url, false).await?;
        }
        let snapshot = driver.snapshot().await?;
        inner.last_snapshot = Some(Arc::new(snapshot));
        inner.phase = SessionPhase::Active;
        info!(room = %room_name, "session recovered");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    async fn fresh_snapshot(&self, session: &Arc<Session>) -> Result<Arc<DomSnapshot>> {
        let mut inner = session.inner.lock().await;
        match inner.phase {
            SessionPhase::Closed => {
                return Err(Error::session(ErrorCode::SessionClosed, "session is closed"))
            }
            SessionPhase::Failed => {
                return Err(Error::session(ErrorCode::DriverCrashed, "session has failed"))
            }
            _ => {}
        }
        let driver = inner
            .driver
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::session(ErrorCode::DriverCrashed, "no driver"))?;
        let snapshot = Arc::new(driver.snapshot().await?);
        inner.last_snapshot = Some(snapshot.clone());
        inner.last_url = Some(snapshot.url.clone());
        Ok(snapshot)
    }

    /// Session context including current page identity.
    pub async fn get_context(&self, room_name: &str) -> Result<SessionContext> {
        let session = self.get(room_name)?;
        let snapshot = self.fresh_snapshot(&session).await?;
        let inner = session.inner.lock().await;
        Ok(SessionContext {
            room_name: room_name.to_string(),
            phase: inner.phase,
            url: snapshot.url.clone(),
            title: snapshot.title.clone(),
            content_hash: snapshot.content_hash.clone(),
            element_count: snapshot.len(),
            last_sequence: inner.sequence.last_processed(),
            actions_executed: inner.actions_executed,
            actions_failed: inner.actions_failed,
            started_at_ms: inner.started_at_ms,
        })
    }

    /// Visible screen content for the agent.
    pub async fn get_screen_content(&self, room_name: &str) -> Result<ScreenContent> {
        let session = self.get(room_name)?;
        let snapshot = self.fresh_snapshot(&session).await?;
        Ok(ScreenContent {
            url: snapshot.url.clone(),
            title: snapshot.title.clone(),
            visible_text: snapshot.visible_text(),
            element_count: snapshot.len(),
            content_hash: snapshot.content_hash.clone(),
        })
    }

    /// Login-field auto-discovery on the current page.
    pub async fn find_form_fields(&self, room_name: &str) -> Result<FormFieldMatch> {
        let session = self.get(room_name)?;
        let snapshot = self.fresh_snapshot(&session).await?;
        Ok(snapshot.find_form_fields())
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Synchronous RPC dispatch path (stream fallback). Skips pre/post
    /// diffing; events are still fanned out.
    pub async fn execute_action(
        &self,
        room_name: &str,
        action: crate::actions::ActionRequest,
        timeout_ms: Option<u64>,
    ) -> Result<ActionResult> {
        let session = self.get(room_name)?;
        let mut inner = session.inner.lock().await;
        check_dispatchable(inner.phase)?;

        let envelope = ActionEnvelope::new(room_name, inner.sequence.last_processed(), action)
            .timeout_ms(timeout_ms.unwrap_or(inner.config.action_timeout_ms));

        let driver = inner
            .driver
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::session(ErrorCode::DriverCrashed, "no driver"))?;
        let last_snapshot = inner.last_snapshot.clone();
        let out = self
            .dispatcher
            .dispatch(&driver, last_snapshot.as_ref(), &envelope, false)
            .await;

        self.integrate_outcome(&mut inner, room_name, &envelope, &out).await;
        Ok(out.result)
    }

    /// Stream dispatch path implementing dedup, sequencing, diffing, state
    /// publication, and event fan-out. Called by the session's command
    /// consumer; the returned outcome drives the ack decision.
    pub async fn process_envelope(&self, envelope: ActionEnvelope) -> Result<ProcessOutcome> {
        let session = self.get(&envelope.room_name)?;
        let mut inner = session.inner.lock().await;
        check_dispatchable(inner.phase)?;

        match inner.dedup.begin(&envelope.command_id) {
            DedupDecision::AlreadyProcessed => return Ok(ProcessOutcome::Duplicate),
            DedupDecision::InFlight => return Ok(ProcessOutcome::InFlight),
            DedupDecision::Fresh => {}
        }

        match inner.sequence.check(envelope.sequence_number) {
            SequenceCheck::Duplicate => {
                inner.dedup.mark_processed(&envelope.command_id);
                return Ok(ProcessOutcome::Duplicate);
            }
            SequenceCheck::Gap { expected } => {
                inner.dedup.forget(&envelope.command_id);
                self.events
                    .publish(
                        BrowserEvent::sequence_gap(
                            &envelope.room_name,
                            expected,
                            envelope.sequence_number,
                        )
                        .correlation_id(envelope.command_id.clone()),
                    )
                    .await;
                return Ok(ProcessOutcome::Gap { expected, got: envelope.sequence_number });
            }
            SequenceCheck::InOrder => {}
        }

        let driver = inner
            .driver
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::session(ErrorCode::DriverCrashed, "no driver"))?;
        let last_snapshot = inner.last_snapshot.clone();
        let out = self
            .dispatcher
            .dispatch(&driver, last_snapshot.as_ref(), &envelope, true)
            .await;

        // Transient failures stay un-acked and un-sequenced so redelivery can
        // re-execute them.
        if let Some(body) = &out.result.error {
            if body.retryable {
                inner.dedup.forget(&envelope.command_id);
                return Ok(ProcessOutcome::TransientFailure(body.clone()));
            }
        }

        self.integrate_outcome(&mut inner, &envelope.room_name, &envelope, &out).await;

        let summary = StateSummary {
            url: inner.last_url.clone().unwrap_or_default(),
            title: inner
                .last_snapshot
                .as_ref()
                .map(|s| s.title.clone())
                .unwrap_or_default(),
            post_hash: inner
                .last_snapshot
                .as_ref()
                .map(|s| s.content_hash.clone())
                .unwrap_or_default(),
        };
        let mut update =
            StateUpdate::for_command(&envelope, out.result.clone(), out.diff.clone(), summary);
        if let Some(data) = out.result.observed_effects.data.as_ref() {
            update.screenshot_ref = data
                .get("screenshot_ref")
                .and_then(|v| v.as_str())
                .map(String::from);
        }
        self.publisher.publish(&update).await?;

        inner.sequence.advance(envelope.sequence_number);
        inner.dedup.mark_processed(&envelope.command_id);
        Ok(ProcessOutcome::Completed(update))
    }

    /// Shared bookkeeping after a dispatch: snapshot cache, metrics, phase
    /// transition on fatal errors, and event fan-out.
    async fn integrate_outcome(
        &self,
        inner: &mut SessionInner,
        room_name: &str,
        envelope: &ActionEnvelope,
        out: &crate::dispatch::DispatchOutput,
    ) {
        if let Some(post) = &out.post_snapshot {
            inner.last_snapshot = Some(post.clone());
            inner.last_url = Some(post.url.clone());
        }
        if let Some(url) = &out.result.observed_effects.navigation {
            inner.last_url = Some(url.clone());
            self.events
                .publish(BrowserEvent::page_navigation(room_name, url.clone()))
                .await;
        }

        if out.result.success {
            inner.actions_executed += 1;
            self.events
                .publish(BrowserEvent::action_completed(
                    room_name,
                    envelope.command_id.clone(),
                    envelope.action.tag(),
                ))
                .await;
        } else {
            inner.actions_failed += 1;
            if let Some(body) = &out.result.error {
                self.events
                    .publish(BrowserEvent::action_error(
                        room_name,
                        Some(envelope.command_id.clone()),
                        body,
                    ))
                    .await;
            }
        }

        if out.fatal {
            warn!(room = %room_name, "driver crash: session failed");
            inner.phase = SessionPhase::Failed;
            self.events
                .publish(BrowserEvent::browser_error(room_name, "driver crashed"))
                .await;
        }
    }
}

fn check_dispatchable(phase: SessionPhase) -> Result<()> {
    match phase {
        SessionPhase::Active | SessionPhase::Paused => Ok(()),
        SessionPhase::Closed => Err(Error::session(ErrorCode::SessionClosed, "session is closed")),
        SessionPhase::Failed => {
            Err(Error::session(ErrorCode::DriverCrashed, "session has failed; recover first"))
        }
        SessionPhase::Starting => {
            Err(Error::transient(ErrorCode::DriverTemporarilyUnavailable, "session is starting"))
        }
    }
}

/// Release driver and video resources, tolerating individual failures so
/// every resource gets a release attempt.
async fn release_resources(inner: &mut SessionInner) {
    if let Some(video) = inner.video.take() {
        if let Err(e) = video.stop_track().await {
            warn!(error = %e, "video stop failed during release");
        }
        if let Err(e) = video.leave().await {
            warn!(error = %e, "video leave failed during release");
        }
    }
    if let Some(driver) = inner.driver.take() {
        if let Err(e) = driver.close().await {
            warn!(error = %e, "driver close failed during release");
        }
    }
    inner.last_snapshot = None;
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionRequest, MouseButton, SpecialKey, Target};
    use crate::bus::BrowserEventType;
    use crate::capabilities::{
        MemoryStreamBus, MockBrowserDriver, MockBrowserDriverFactory, MockVideoPublisherFactory,
    };
    use crate::dom::DomElement;

    struct Harness {
        manager: Arc<SessionManager>,
        drivers: Arc<MockBrowserDriverFactory>,
        videos: Arc<MockVideoPublisherFactory>,
        bus: Arc<MemoryStreamBus>,
    }

    fn harness() -> Harness {
        let drivers = Arc::new(MockBrowserDriverFactory::new());
        let videos = Arc::new(MockVideoPublisherFactory::new());
        let bus = Arc::new(MemoryStreamBus::new());
        let mut config = ServiceConfig::default();
        config.stream.claim_idle_secs = 0;
        config.stream.block_ms = 20;
        let manager = SessionManager::builder()
            .driver_factory(drivers.clone())
            .video_factory(videos.clone())
            .bus(bus.clone())
            .config(config)
            .build()
            .unwrap();
        Harness { manager, drivers, videos, bus }
    }

    fn login_page() -> DomSnapshot {
        DomSnapshot::from_parts(
            "https://example.com/login",
            "Login",
            vec![
                DomElement::new("input").input_type("email").name("email").form_id("login"),
                DomElement::new("input").input_type("password").name("password").form_id("login"),
                DomElement::new("button").text("Sign in").form_id("login"),
            ],
        )
    }

    fn dashboard_page() -> DomSnapshot {
        DomSnapshot::from_parts(
            "https://example.com/dashboard",
            "Dashboard",
            vec![DomElement::new("h1").text("Welcome back")],
        )
    }

    async fn start_login_session(h: &Harness, room: &str, stream_mode: bool) -> Arc<MockBrowserDriver> {
        let driver = Arc::new(MockBrowserDriver::with_page(login_page()));
        h.drivers.script(driver.clone());
        let mut cfg = SessionConfig::new(room).initial_url("https://example.com/login");
        cfg.stream_mode = stream_mode;
        h.manager.start_session(cfg).await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_lifecycle_start_pause_resume_close() {
        let h = harness();
        start_login_session(&h, "demo", false).await;
        assert_eq!(h.manager.phase("demo").await, Some(SessionPhase::Active));

        h.manager.pause_session("demo").await.unwrap();
        assert_eq!(h.manager.phase("demo").await, Some(SessionPhase::Paused));
        assert!(!h.videos.last().unwrap().is_publishing().await);

        h.manager.resume_session("demo").await.unwrap();
        assert_eq!(h.manager.phase("demo").await, Some(SessionPhase::Active));

        h.manager.close_session("demo").await.unwrap();
        assert_eq!(h.manager.phase("demo").await, None);
        assert!(h.manager.get_context("demo").await.is_err());
    }

    #[tokio::test]
    async fn test_start_duplicate_room_rejected() {
        let h = harness();
        start_login_session(&h, "demo", false).await;
        let err = h
            .manager
            .start_session(SessionConfig::new("demo"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionAlreadyExists);
    }

    #[tokio::test]
    async fn test_session_not_found() {
        let h = harness();
        let err = h.manager.get_context("ghost").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn test_find_form_fields_query() {
        let h = harness();
        start_login_session(&h, "demo", false).await;
        let fields = h.manager.find_form_fields("demo").await.unwrap();
        assert_eq!(fields.username_index, Some(0));
        assert_eq!(fields.password_index, Some(1));
        assert_eq!(fields.submit_index, Some(2));
    }

    #[tokio::test]
    async fn test_execute_action_rpc_path() {
        let h = harness();
        start_login_session(&h, "demo", false).await;

        let result = h
            .manager
            .execute_action(
                "demo",
                ActionRequest::Type { text: "alice".into(), index: Some(0) },
                None,
            )
            .await
            .unwrap();
        assert!(result.success);

        let completed = h.manager.events().events_by_type(BrowserEventType::ActionCompleted);
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn test_driver_crash_fails_session_and_recovers() {
        let h = harness();
        let driver = start_login_session(&h, "demo", false).await;
        driver.kill();

        let result = h
            .manager
            .execute_action(
                "demo",
                ActionRequest::Click { target: Target::index(0), button: MouseButton::Left },
                None,
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(h.manager.phase("demo").await, Some(SessionPhase::Failed));

        // Recovery recreates a dead driver and re-navigates.
        h.manager.recover_session("demo").await.unwrap();
        assert_eq!(h.manager.phase("demo").await, Some(SessionPhase::Active));
        let ctx = h.manager.get_context("demo").await.unwrap();
        assert_eq!(ctx.url, "https://example.com/login");
    }

    #[tokio::test]
    async fn test_process_envelope_publishes_state_update() {
        let h = harness();
        let driver = start_login_session(&h, "demo", false).await;
        driver.queue_page(dashboard_page());

        let env = ActionEnvelope::new(
            "demo",
            1,
            ActionRequest::Click { target: Target::index(2), button: MouseButton::Left },
        );
        let outcome = h.manager.process_envelope(env.clone()).await.unwrap();
        let ProcessOutcome::Completed(update) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(update.command_id, env.command_id);
        assert_eq!(update.sequence_number, 1);
        assert!(update.action_result.success);
        assert_eq!(update.current_state_summary.url, "https://example.com/dashboard");

        // Login succeeded: password field disappeared across the navigation.
        let diff = update.state_diff.unwrap();
        let login_events = diff.events_of(crate::diff::SemanticEventType::LoginSuccess);
        assert_eq!(login_events.len(), 1);

        assert_eq!(h.bus.stream_len("state:demo").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_process_envelope_duplicate_command_id() {
        let h = harness();
        start_login_session(&h, "demo", false).await;

        let env = ActionEnvelope::new(
            "demo",
            1,
            ActionRequest::SendKeys { keys: vec![SpecialKey::Enter], index: None },
        )
        .command_id("cmd-dup");

        let first = h.manager.process_envelope(env.clone()).await.unwrap();
        assert!(matches!(first, ProcessOutcome::Completed(_)));

        let second = h.manager.process_envelope(env).await.unwrap();
        assert!(matches!(second, ProcessOutcome::Duplicate));

        // Exactly one state update and one action_completed event.
        assert_eq!(h.bus.stream_len("state:demo").await.unwrap(), 1);
        let completed = h.manager.events().events_by_type(BrowserEventType::ActionCompleted);
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn test_process_envelope_sequence_gap() {
        let h = harness();
        start_login_session(&h, "demo", false).await;

        for seq in [1u64, 2] {
            let env = ActionEnvelope::new(
                "demo",
                seq,
                ActionRequest::SendKeys { keys: vec![SpecialKey::Tab], index: None },
            );
            assert!(matches!(
                h.manager.process_envelope(env).await.unwrap(),
                ProcessOutcome::Completed(_)
            ));
        }

        let gap_env = ActionEnvelope::new(
            "demo",
            4,
            ActionRequest::SendKeys { keys: vec![SpecialKey::Tab], index: None },
        );
        let outcome = h.manager.process_envelope(gap_env.clone()).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Gap { expected: 3, got: 4 }));

        let gap_events = h.manager.events().events_by_type(BrowserEventType::SequenceGap);
        assert_eq!(gap_events.len(), 1);
        assert_eq!(gap_events[0].data["expected"], 3);

        // After seq 3 lands, seq 4 becomes processable on redelivery.
        let env3 = ActionEnvelope::new(
            "demo",
            3,
            ActionRequest::SendKeys { keys: vec![SpecialKey::Tab], index: None },
        );
        assert!(matches!(
            h.manager.process_envelope(env3).await.unwrap(),
            ProcessOutcome::Completed(_)
        ));
        assert!(matches!(
            h.manager.process_envelope(gap_env).await.unwrap(),
            ProcessOutcome::Completed(_)
        ));

        // State updates are in contiguous sequence order 1..=4.
        let mut seqs = Vec::new();
        for _ in 0..4 {
            let entry = h
                .bus
                .read_group("state:demo", "readers", "r", 10)
                .await
                .unwrap()
                .unwrap();
            let update: StateUpdate = serde_json::from_value(entry.payload).unwrap();
            seqs.push(update.sequence_number);
            h.bus.ack("state:demo", "readers", entry.id).await.unwrap();
        }
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_stream_consumer_end_to_end_gap_scenario() {
        let h = harness();
        start_login_session(&h, "demo", true).await;

        // Publish seq 1, 2, 4 (skip 3) onto the command stream.
        for seq in [1u64, 2, 4] {
            let env = ActionEnvelope::new(
                "demo",
                seq,
                ActionRequest::SendKeys { keys: vec![SpecialKey::Tab], index: None },
            );
            h.bus
                .append("commands:demo", serde_json::to_value(&env).unwrap(), 10_000)
                .await
                .unwrap();
        }

        // Wait for updates 1 and 2 plus the gap event for 4.
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if h.bus.stream_len("state:demo").await.unwrap() >= 2
                    && !h
                        .manager
                        .events()
                        .events_by_type(BrowserEventType::SequenceGap)
                        .is_empty()
                {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("updates for 1 and 2 plus a gap event");

        // Retransmit seq 3; the pending seq-4 entry is then claimed and both
        // complete in order.
        let env3 = ActionEnvelope::new(
            "demo",
            3,
            ActionRequest::SendKeys { keys: vec![SpecialKey::Tab], index: None },
        );
        h.bus
            .append("commands:demo", serde_json::to_value(&env3).unwrap(), 10_000)
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while h.bus.stream_len("state:demo").await.unwrap() < 4 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all four state updates");

        let mut seqs = Vec::new();
        while let Some(entry) = h.bus.read_group("state:demo", "readers", "r", 10).await.unwrap() {
            let update: StateUpdate = serde_json::from_value(entry.payload).unwrap();
            seqs.push(update.sequence_number);
            h.bus.ack("state:demo", "readers", entry.id).await.unwrap();
        }
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        h.manager.close_session("demo").await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_consumer_duplicate_command_scenario() {
        let h = harness();
        start_login_session(&h, "demo", true).await;

        let env = ActionEnvelope::new(
            "demo",
            1,
            ActionRequest::SendKeys { keys: vec![SpecialKey::Enter], index: None },
        )
        .command_id("cmd-same");
        for _ in 0..2 {
            h.bus
                .append("commands:demo", serde_json::to_value(&env).unwrap(), 10_000)
                .await
                .unwrap();
        }

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while h.bus.stream_len("state:demo").await.unwrap() < 1 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("one state update");

        // Let the consumer drain the duplicate as well.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(h.bus.stream_len("state:demo").await.unwrap(), 1);
        let completed = h.manager.events().events_by_type(BrowserEventType::ActionCompleted);
        assert_eq!(completed.len(), 1);

        h.manager.close_session("demo").await.unwrap();
    }

    #[tokio::test]
    async fn test_login_flow_via_form_field_discovery() {
        let h = harness();
        let driver = start_login_session(&h, "demo", false).await;

        let fields = h.manager.find_form_fields("demo").await.unwrap();
        let (user, pass, submit) = (
            fields.username_index.unwrap(),
            fields.password_index.unwrap(),
            fields.submit_index.unwrap(),
        );

        for (seq, action) in [
            (1u64, ActionRequest::Type { text: "alice".into(), index: Some(user) }),
            (2, ActionRequest::Type { text: "s3cret".into(), index: Some(pass) }),
        ] {
            let env = ActionEnvelope::new("demo", seq, action);
            assert!(matches!(
                h.manager.process_envelope(env).await.unwrap(),
                ProcessOutcome::Completed(_)
            ));
        }

        driver.queue_page(dashboard_page());
        let click = ActionEnvelope::new(
            "demo",
            3,
            ActionRequest::Click { target: Target::index(submit), button: MouseButton::Left },
        );
        let ProcessOutcome::Completed(update) = h.manager.process_envelope(click).await.unwrap()
        else {
            panic!("expected completion");
        };
        let diff = update.state_diff.unwrap();
        let success = diff.events_of(crate::diff::SemanticEventType::LoginSuccess).len();
        let failure = diff.events_of(crate::diff::SemanticEventType::LoginFailure).len();
        assert_eq!(success + failure, 1);
        assert_eq!(success, 1);
    }
}
