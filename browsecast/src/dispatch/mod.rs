//! Action Dispatcher
//!
//! Translates a validated [`ActionEnvelope`] into driver calls:
//! resolves index-addressed targets against the session's last snapshot
//! (remapping by element signature when the DOM moved underneath the caller),
//! enforces per-action preconditions, executes the handler under the
//! envelope's timeout, retries transient failures once, and computes the
//! pre/post state diff when stream mode is active.
//!
//! The caller holds the session's critical section for the whole dispatch.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::actions::{ActionRequest, ClipboardOp, Point, ScrollDirection, Target};
use crate::capabilities::{
    BrowserDriver, DriverButton, MediaCommand, OverlayCommand, ResolvedTarget, ZoomCommand,
};
use crate::delay::{DelayAggregator, DelayKey, DelaySample};
use crate::diff::{diff_snapshots, StateDiff};
use crate::dom::DomSnapshot;
use crate::error::{Error, ErrorClass, ErrorCode, Result};
use crate::stream::{ActionEnvelope, ActionResult, ObservedEffects};

/// Backoff before the single in-handler retry of a transient failure.
const SHORT_RETRY_BACKOFF_MS: u64 = 100;

/// Everything a dispatch produced, for the session to integrate.
#[derive(Debug)]
pub struct DispatchOutput {
    pub result: ActionResult,
    pub diff: Option<StateDiff>,
    /// Fresh snapshot to install as the session's last snapshot
    pub post_snapshot: Option<Arc<DomSnapshot>>,
    /// The driver is gone; the session must transition to Failed
    pub fatal: bool,
}

/// Stateless action executor shared by all sessions.
pub struct ActionDispatcher {
    delay: Arc<DelayAggregator>,
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(DelayAggregator::new()))
    }
}

impl ActionDispatcher {
    pub fn new(delay: Arc<DelayAggregator>) -> Self {
        Self { delay }
    }

    /// The shared delay aggregator
    pub fn delay_aggregator(&self) -> Arc<DelayAggregator> {
        self.delay.clone()
    }

    /// Execute one envelope against a driver. `last_snapshot` is the snapshot
    /// the caller's indices refer to; `capture_diff` is true in stream mode.
    pub async fn dispatch(
        &self,
        driver: &Arc<dyn BrowserDriver>,
        last_snapshot: Option<&Arc<DomSnapshot>>,
        envelope: &ActionEnvelope,
        capture_diff: bool,
    ) -> DispatchOutput {
        let started = Instant::now();

        if let Err(e) = envelope.validate() {
            return DispatchOutput {
                result: ActionResult::failed(elapsed_ms(started), e.to_body()),
                diff: None,
                post_snapshot: None,
                fatal: false,
            };
        }

        // Resolve the target and capture the pre-action snapshot in one pass:
        // index-bearing actions need a current view of the DOM either way.
        let needs_snapshot = capture_diff && envelope.action.is_mutating();
        let pre_snapshot = if needs_snapshot || envelope.action.target_index().is_some() {
            match driver.snapshot().await {
                Ok(snap) => Some(Arc::new(snap)),
                Err(e) => {
                    let fatal = e.code() == ErrorCode::DriverCrashed;
                    return DispatchOutput {
                        result: ActionResult::failed(elapsed_ms(started), e.to_body()),
                        diff: None,
                        post_snapshot: None,
                        fatal,
                    };
                }
            }
        } else {
            None
        };

        let action = match resolve_action(&envelope.action, last_snapshot, pre_snapshot.as_ref()) {
            Ok(action) => action,
            Err(e) => {
                return DispatchOutput {
                    result: ActionResult::failed(elapsed_ms(started), e.to_body()),
                    diff: None,
                    post_snapshot: None,
                    fatal: false,
                };
            }
        };

        if let Some(snap) = pre_snapshot.as_ref() {
            if let Err(e) = check_preconditions(&action, snap) {
                return DispatchOutput {
                    result: ActionResult::failed(elapsed_ms(started), e.to_body()),
                    diff: None,
                    post_snapshot: None,
                    fatal: false,
                };
            }
        }

        // Handler execution under the envelope timeout, one transient retry.
        let timeout = Duration::from_millis(envelope.timeout_ms.max(1));
        let mut handler_data: Option<serde_json::Value> = None;
        let mut last_err: Option<Error> = None;
        for attempt in 0..2 {
            let run = run_handler(driver, &action);
            match tokio::time::timeout(timeout, run).await {
                Err(_) => {
                    last_err = Some(Error::permanent(
                        ErrorCode::ActionTimeout,
                        format!("{} exceeded {}ms", action.tag(), envelope.timeout_ms),
                    ));
                    break;
                }
                Ok(Ok(data)) => {
                    handler_data = data;
                    last_err = None;
                    break;
                }
                Ok(Err(e)) => {
                    let transient = e.class() == ErrorClass::Transient;
                    last_err = Some(e);
                    if transient && attempt == 0 {
                        debug!(action = action.tag(), "transient failure, retrying once");
                        tokio::time::sleep(Duration::from_millis(SHORT_RETRY_BACKOFF_MS)).await;
                        continue;
                    }
                    break;
                }
            }
        }

        if let Some(e) = last_err {
            let fatal = e.code() == ErrorCode::DriverCrashed;
            if fatal {
                warn!(action = action.tag(), "driver crashed during dispatch");
            }
            return DispatchOutput {
                result: ActionResult::failed(elapsed_ms(started), e.to_body()),
                diff: None,
                post_snapshot: None,
                fatal,
            };
        }

        // Post snapshot + diff (stream mode only).
        let (post_snapshot, diff) = if capture_diff && envelope.action.is_mutating() {
            match driver.snapshot().await {
                Ok(post) => {
                    let post = Arc::new(post);
                    let diff = pre_snapshot.as_ref().map(|pre| diff_snapshots(pre, &post));
                    (Some(post), diff)
                }
                Err(e) => {
                    warn!(error = %e, "post-action snapshot failed");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let duration_ms = elapsed_ms(started);
        let effects = observed_effects(pre_snapshot.as_deref(), post_snapshot.as_deref(), diff.as_ref(), handler_data);
        self.record_delay(envelope, duration_ms, &effects, diff.as_ref());

        DispatchOutput {
            result: ActionResult::ok(duration_ms, effects),
            diff,
            post_snapshot,
            fatal: false,
        }
    }

    /// Feed the delay aggregator when the envelope carries knowledge-tier
    /// provenance in its trace context.
    fn record_delay(
        &self,
        envelope: &ActionEnvelope,
        duration_ms: u64,
        effects: &ObservedEffects,
        diff: Option<&StateDiff>,
    ) {
        let Some(trace) = &envelope.trace_context else { return };
        let key = if let Some(transition_id) = trace.get("transition_id") {
            DelayKey::transition(transition_id.clone())
        } else if let (Some(screen_id), Some(action_id)) =
            (trace.get("screen_id"), trace.get("action_id"))
        {
            DelayKey::screen_action(screen_id.clone(), action_id.clone())
        } else {
            return;
        };
        self.delay.record(
            key,
            DelaySample {
                duration_ms,
                url_changed: effects.navigation.is_some(),
                dom_stable: diff.map(|d| d.dom_changes.is_empty()).unwrap_or(true),
                network_idle: true,
            },
        );
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// =============================================================================
// TARGET RESOLUTION
// =============================================================================

/// Remap the action's index against the current snapshot when the DOM the
/// caller saw is stale. Fails with `ElementIndexStale` when the referenced
/// element no longer exists, and `ElementNotFound` when the index was never
/// valid.
fn resolve_action(
    action: &ActionRequest,
    reference: Option<&Arc<DomSnapshot>>,
    current: Option<&Arc<DomSnapshot>>,
) -> Result<ActionRequest> {
    let Some(index) = action.target_index() else {
        return Ok(action.clone());
    };
    let Some(current) = current else {
        return Ok(action.clone());
    };

    let resolved = match reference {
        Some(reference) if reference.content_hash != current.content_hash => {
            // Caller addressed a stale snapshot: remap by signature.
            match current.remap_index(reference, index) {
                Some(new_index) => {
                    if new_index != index {
                        debug!(old = index, new = new_index, "remapped stale element index");
                    }
                    new_index
                }
                None => {
                    return Err(Error::resolution(
                        ErrorCode::ElementIndexStale,
                        format!("element at stale index {} has no match in the current DOM", index),
                    ));
                }
            }
        }
        _ => {
            if current.element(index).is_none() {
                return Err(Error::resolution(
                    ErrorCode::ElementNotFound,
                    format!("no element at index {} ({} elements)", index, current.len()),
                ));
            }
            index
        }
    };

    Ok(rewrite_index(action, resolved))
}

/// Replace the primary index of an index-bearing action.
fn rewrite_index(action: &ActionRequest, new_index: usize) -> ActionRequest {
    use ActionRequest::*;
    let mut out = action.clone();
    match &mut out {
        Click { target, .. } | RightClick { target } | DoubleClick { target } | Hover { target } => {
            target.index = Some(new_index);
        }
        Type { index, .. }
        | TypeSlowly { index, .. }
        | Clear { index }
        | SelectAll { index }
        | Copy { index }
        | Paste { index }
        | Cut { index }
        | SendKeys { index, .. }
        | KeyboardShortcut { index, .. }
        | UploadFile { index, .. }
        | SubmitForm { index }
        | ResetForm { index }
        | PlayVideo { index }
        | PauseVideo { index }
        | SeekVideo { index, .. }
        | AdjustVolume { index, .. }
        | ToggleFullscreen { index }
        | ToggleMute { index }
        | DownloadFile { index, .. } => {
            *index = Some(new_index);
        }
        SelectDropdown { index, .. }
        | SelectMultiple { index, .. }
        | HighlightElement { index, .. }
        | FocusElement { index } => {
            *index = new_index;
        }
        _ => {}
    }
    out
}

// =============================================================================
// PRECONDITIONS
// =============================================================================

/// Per-action preconditions against the current snapshot.
fn check_preconditions(action: &ActionRequest, snapshot: &Arc<DomSnapshot>) -> Result<()> {
    let element = action.target_index().and_then(|i| snapshot.element(i));

    match action {
        ActionRequest::Click { .. }
        | ActionRequest::RightClick { .. }
        | ActionRequest::DoubleClick { .. } => {
            if let Some(el) = element {
                if !el.visible {
                    return Err(Error::resolution(
                        ErrorCode::ElementNotFound,
                        format!("element {} is not visible", el.index),
                    ));
                }
                if !el.enabled {
                    return Err(Error::resolution(
                        ErrorCode::ElementNotFound,
                        format!("element {} is disabled", el.index),
                    ));
                }
            }
        }
        ActionRequest::Type { .. } | ActionRequest::TypeSlowly { .. } | ActionRequest::Clear { .. } => {
            if let Some(el) = element {
                if !el.is_text_input() {
                    return Err(Error::resolution(
                        ErrorCode::ElementNotFound,
                        format!("element {} ({}) is not a text input", el.index, el.tag),
                    ));
                }
                if el.attributes.readonly {
                    return Err(Error::resolution(
                        ErrorCode::ElementNotFound,
                        format!("element {} is readonly", el.index),
                    ));
                }
            }
        }
        ActionRequest::UploadFile { .. } => {
            if let Some(el) = element {
                if el.attributes.input_type.as_deref() != Some("file") {
                    return Err(Error::permanent(
                        ErrorCode::FileUploadFailed,
                        format!("element {} is not a file input", el.index),
                    ));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

// =============================================================================
// HANDLERS
// =============================================================================

fn to_driver_button(button: crate::actions::MouseButton) -> DriverButton {
    match button {
        crate::actions::MouseButton::Left => DriverButton::Left,
        crate::actions::MouseButton::Right => DriverButton::Right,
        crate::actions::MouseButton::Middle => DriverButton::Middle,
    }
}

fn to_resolved(target: &Target) -> ResolvedTarget {
    match (target.index, target.coord) {
        (Some(i), _) => ResolvedTarget::Index(i),
        (None, Some(p)) => ResolvedTarget::Coord(p),
        // validate() has run; this arm is unreachable for valid requests
        (None, None) => ResolvedTarget::Coord(Point::default()),
    }
}

fn scroll_delta(direction: ScrollDirection, amount: f64) -> (f64, f64) {
    match direction {
        ScrollDirection::Up => (0.0, -amount),
        ScrollDirection::Down => (0.0, amount),
        ScrollDirection::Left => (-amount, 0.0),
        ScrollDirection::Right => (amount, 0.0),
    }
}

async fn drag_point(driver: &Arc<dyn BrowserDriver>, target: &Target) -> Result<Point> {
    if let Some(coord) = target.coord {
        return Ok(coord);
    }
    let index = target.index.ok_or_else(|| Error::invalid_params("drag_drop: empty target"))?;
    let snapshot = driver.snapshot().await?;
    let el = snapshot.element(index).ok_or_else(|| {
        Error::resolution(ErrorCode::ElementNotFound, format!("no element at index {}", index))
    })?;
    let (x, y) = el.bbox.center();
    Ok(Point::new(x, y))
}

/// Execute one resolved, precondition-checked action against the driver.
/// Returns handler-specific payload data when the action produces one.
async fn run_handler(
    driver: &Arc<dyn BrowserDriver>,
    action: &ActionRequest,
) -> Result<Option<serde_json::Value>> {
    use ActionRequest::*;
    match action {
        Navigate { url, new_tab } => {
            driver.navigate(url, *new_tab).await?;
            Ok(None)
        }
        Click { target, button } => {
            driver.click(to_resolved(target), to_driver_button(*button), 1).await?;
            Ok(None)
        }
        RightClick { target } => {
            driver.click(to_resolved(target), DriverButton::Right, 1).await?;
            Ok(None)
        }
        DoubleClick { target } => {
            driver.click(to_resolved(target), DriverButton::Left, 2).await?;
            Ok(None)
        }
        Hover { target } => {
            driver.hover(to_resolved(target)).await?;
            Ok(None)
        }
        Type { text, index } => {
            driver.type_text(*index, text, None).await?;
            Ok(None)
        }
        TypeSlowly { text, index, delay_ms } => {
            driver.type_text(*index, text, Some(*delay_ms)).await?;
            Ok(None)
        }
        Clear { index } => {
            driver.clear(*index).await?;
            Ok(None)
        }
        SelectAll { index } => {
            driver.clipboard(ClipboardOp::SelectAll, *index).await?;
            Ok(None)
        }
        Copy { index } => {
            let text = driver.clipboard(ClipboardOp::Copy, *index).await?;
            Ok(text.map(|t| serde_json::json!({"clipboard": t})))
        }
        Paste { index } => {
            driver.clipboard(ClipboardOp::Paste, *index).await?;
            Ok(None)
        }
        Cut { index } => {
            let text = driver.clipboard(ClipboardOp::Cut, *index).await?;
            Ok(text.map(|t| serde_json::json!({"clipboard": t})))
        }
        Scroll { direction, amount } => {
            let (dx, dy) = scroll_delta(*direction, *amount);
            driver.scroll_by(dx, dy, None).await?;
            Ok(None)
        }
        AnimateScroll { direction, amount, duration_ms } => {
            let (dx, dy) = scroll_delta(*direction, *amount);
            driver.scroll_by(dx, dy, Some(*duration_ms)).await?;
            Ok(None)
        }
        SendKeys { keys, index } => {
            driver.press_keys(keys, *index).await?;
            Ok(None)
        }
        KeyboardShortcut { keys, index } => {
            driver.shortcut(keys, *index).await?;
            Ok(None)
        }
        Wait { seconds } => {
            tokio::time::sleep(Duration::from_secs_f64(*seconds)).await;
            Ok(None)
        }
        GoBack => {
            driver.back().await?;
            Ok(None)
        }
        GoForward => {
            driver.forward().await?;
            Ok(None)
        }
        Refresh => {
            driver.refresh().await?;
            Ok(None)
        }
        DragDrop { start, end } => {
            let start_pt = drag_point(driver, start).await?;
            let end_pt = drag_point(driver, end).await?;
            driver.drag(start_pt, end_pt).await?;
            Ok(None)
        }
        UploadFile { file_path, index } => {
            driver.set_file_input(*index, file_path).await?;
            Ok(None)
        }
        SelectDropdown { index, option } => {
            driver.select_option(*index, option).await?;
            Ok(None)
        }
        FillForm { fields } => {
            // Per-field application; partial success is reported field by
            // field and the action fails if any field failed.
            let mut outcomes = Vec::with_capacity(fields.len());
            let mut all_ok = true;
            for field in fields {
                match driver.type_text(Some(field.index), &field.value, None).await {
                    Ok(()) => outcomes.push(serde_json::json!({"index": field.index, "success": true})),
                    Err(e) => {
                        all_ok = false;
                        outcomes.push(serde_json::json!({
                            "index": field.index,
                            "success": false,
                            "error": e.to_body(),
                        }));
                    }
                }
            }
            let data = serde_json::json!({"fields": outcomes});
            if all_ok {
                Ok(Some(data))
            } else {
                Err(Error::permanent(
                    ErrorCode::SubmissionRejected,
                    format!("fill_form: partial failure: {}", data),
                ))
            }
        }
        SelectMultiple { index, values } => {
            driver.select_values(*index, values).await?;
            Ok(None)
        }
        SubmitForm { index } => {
            driver.submit_form(*index).await?;
            Ok(None)
        }
        ResetForm { index } => {
            driver.reset_form(*index).await?;
            Ok(None)
        }
        PlayVideo { index } => {
            driver.media(*index, MediaCommand::Play).await?;
            Ok(None)
        }
        PauseVideo { index } => {
            driver.media(*index, MediaCommand::Pause).await?;
            Ok(None)
        }
        SeekVideo { index, time } => {
            driver.media(*index, MediaCommand::Seek(time.max(0.0))).await?;
            Ok(None)
        }
        AdjustVolume { index, volume } => {
            driver.media(*index, MediaCommand::Volume(volume.clamp(0.0, 1.0))).await?;
            Ok(None)
        }
        ToggleFullscreen { index } => {
            driver.media(*index, MediaCommand::ToggleFullscreen).await?;
            Ok(None)
        }
        ToggleMute { index } => {
            driver.media(*index, MediaCommand::ToggleMute).await?;
            Ok(None)
        }
        TakeScreenshot => {
            let reference = driver.screenshot().await?;
            Ok(Some(serde_json::json!({"screenshot_ref": reference})))
        }
        MultiSelect { indices } => {
            driver.multi_select(indices).await?;
            Ok(None)
        }
        HighlightElement { index, color } => {
            driver
                .overlay(OverlayCommand::HighlightElement { index: *index, color: color.clone() })
                .await?;
            Ok(None)
        }
        HighlightRegion { region, color } => {
            driver
                .overlay(OverlayCommand::HighlightRegion { region: *region, color: color.clone() })
                .await?;
            Ok(None)
        }
        DrawOnPage { points, color } => {
            driver
                .overlay(OverlayCommand::Draw { points: points.clone(), color: color.clone() })
                .await?;
            Ok(None)
        }
        ZoomIn => {
            driver.zoom(ZoomCommand::In).await?;
            Ok(None)
        }
        ZoomOut => {
            driver.zoom(ZoomCommand::Out).await?;
            Ok(None)
        }
        ZoomReset => {
            driver.zoom(ZoomCommand::Reset).await?;
            Ok(None)
        }
        DownloadFile { url, index } => {
            let reference = driver.download(url.as_deref(), *index).await?;
            Ok(Some(serde_json::json!({"download_ref": reference})))
        }
        PresentationMode { enabled } => {
            driver.overlay(OverlayCommand::Presentation { enabled: *enabled }).await?;
            Ok(None)
        }
        ShowPointer { enabled } => {
            driver.overlay(OverlayCommand::Pointer { enabled: *enabled }).await?;
            Ok(None)
        }
        FocusElement { index } => {
            driver.focus(*index).await?;
            Ok(None)
        }
    }
}

/// Derive the best-effort observed effects from snapshots and diff.
fn observed_effects(
    pre: Option<&DomSnapshot>,
    post: Option<&DomSnapshot>,
    diff: Option<&StateDiff>,
    handler_data: Option<serde_json::Value>,
) -> ObservedEffects {
    let navigation = match (pre, post) {
        (Some(pre), Some(post)) if pre.url != post.url => Some(post.url.clone()),
        _ => None,
    };
    let (visibility_changed, form_fields_changed) = diff
        .map(|d| {
            (
                !d.dom_changes.added.is_empty() || !d.dom_changes.removed.is_empty(),
                !d.form_state_changes.is_empty(),
            )
        })
        .unwrap_or((false, false));
    ObservedEffects { navigation, visibility_changed, form_fields_changed, data: handler_data }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::MouseButton;
    use crate::capabilities::MockBrowserDriver;
    use crate::dom::DomElement;

    fn login_page() -> DomSnapshot {
        DomSnapshot::from_parts(
            "https://example.com/login",
            "Login",
            vec![
                DomElement::new("input").input_type("email").name("email"),
                DomElement::new("input").input_type("password").name("password"),
                DomElement::new("button").text("Sign in"),
            ],
        )
    }

    fn click_envelope(index: usize) -> ActionEnvelope {
        ActionEnvelope::new(
            "demo",
            1,
            ActionRequest::Click { target: Target::index(index), button: MouseButton::Left },
        )
    }

    #[tokio::test]
    async fn test_dispatch_click_success_with_diff() {
        let driver: Arc<dyn BrowserDriver> = Arc::new(MockBrowserDriver::with_page(login_page()));
        let dispatcher = ActionDispatcher::default();

        let out = dispatcher.dispatch(&driver, None, &click_envelope(2), true).await;
        assert!(out.result.success);
        assert!(out.diff.is_some());
        assert!(out.post_snapshot.is_some());
        assert!(!out.fatal);
    }

    #[tokio::test]
    async fn test_dispatch_skips_diff_outside_stream_mode() {
        let driver: Arc<dyn BrowserDriver> = Arc::new(MockBrowserDriver::with_page(login_page()));
        let dispatcher = ActionDispatcher::default();

        let out = dispatcher.dispatch(&driver, None, &click_envelope(2), false).await;
        assert!(out.result.success);
        assert!(out.diff.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_element_not_found() {
        let driver: Arc<dyn BrowserDriver> = Arc::new(MockBrowserDriver::with_page(login_page()));
        let dispatcher = ActionDispatcher::default();

        let out = dispatcher.dispatch(&driver, None, &click_envelope(99), true).await;
        assert!(!out.result.success);
        assert_eq!(out.result.error.as_ref().unwrap().code, ErrorCode::ElementNotFound);
    }

    #[tokio::test]
    async fn test_dispatch_remaps_stale_index() {
        // The caller saw the login page; the live DOM now has a banner at
        // index 0 shifting everything down by one.
        let old = Arc::new(login_page());
        let live = DomSnapshot::from_parts(
            "https://example.com/login",
            "Login",
            vec![
                DomElement::new("div").role("alert").text("Notice"),
                DomElement::new("input").input_type("email").name("email"),
                DomElement::new("input").input_type("password").name("password"),
                DomElement::new("button").text("Sign in"),
            ],
        );
        let mock = Arc::new(MockBrowserDriver::with_page(live));
        let driver: Arc<dyn BrowserDriver> = mock.clone();
        let dispatcher = ActionDispatcher::default();

        let out = dispatcher.dispatch(&driver, Some(&old), &click_envelope(2), true).await;
        assert!(out.result.success);
        // Button was at caller-index 2; remapped to live index 3.
        assert!(mock.calls().iter().any(|c| c == "click:3:1"));
    }

    #[tokio::test]
    async fn test_dispatch_stale_index_unmappable() {
        let old = Arc::new(login_page());
        let live = DomSnapshot::from_parts("https://example.com/home", "Home", vec![]);
        let driver: Arc<dyn BrowserDriver> = Arc::new(MockBrowserDriver::with_page(live));
        let dispatcher = ActionDispatcher::default();

        let out = dispatcher.dispatch(&driver, Some(&old), &click_envelope(2), true).await;
        assert!(!out.result.success);
        assert_eq!(out.result.error.as_ref().unwrap().code, ErrorCode::ElementIndexStale);
    }

    #[tokio::test]
    async fn test_dispatch_precondition_disabled_element() {
        let page = DomSnapshot::from_parts(
            "https://example.com",
            "Page",
            vec![DomElement::new("button").text("Buy").enabled(false)],
        );
        let driver: Arc<dyn BrowserDriver> = Arc::new(MockBrowserDriver::with_page(page));
        let dispatcher = ActionDispatcher::default();

        let out = dispatcher.dispatch(&driver, None, &click_envelope(0), true).await;
        assert!(!out.result.success);
    }

    #[tokio::test]
    async fn test_dispatch_type_into_non_input_rejected() {
        let page = DomSnapshot::from_parts(
            "https://example.com",
            "Page",
            vec![DomElement::new("div").text("not a field")],
        );
        let driver: Arc<dyn BrowserDriver> = Arc::new(MockBrowserDriver::with_page(page));
        let dispatcher = ActionDispatcher::default();
        let env = ActionEnvelope::new(
            "demo",
            1,
            ActionRequest::Type { text: "hello".into(), index: Some(0) },
        );

        let out = dispatcher.dispatch(&driver, None, &env, true).await;
        assert!(!out.result.success);
    }

    #[tokio::test]
    async fn test_dispatch_transient_retry_succeeds() {
        let mock = Arc::new(MockBrowserDriver::with_page(login_page()));
        mock.fail_next(Error::transient(ErrorCode::DriverTemporarilyUnavailable, "busy"));
        let driver: Arc<dyn BrowserDriver> = mock.clone();
        let dispatcher = ActionDispatcher::default();

        let out = dispatcher.dispatch(&driver, None, &click_envelope(2), false).await;
        assert!(out.result.success, "transient failure should be retried once");
    }

    #[tokio::test]
    async fn test_dispatch_permanent_failure_not_retried() {
        let mock = Arc::new(MockBrowserDriver::with_page(login_page()));
        mock.fail_next(Error::permanent(ErrorCode::NavigationFailed, "blocked"));
        let driver: Arc<dyn BrowserDriver> = mock.clone();
        let dispatcher = ActionDispatcher::default();
        let env = ActionEnvelope::new(
            "demo",
            1,
            ActionRequest::Navigate { url: "https://example.com".into(), new_tab: false },
        );

        let out = dispatcher.dispatch(&driver, None, &env, false).await;
        assert!(!out.result.success);
        assert_eq!(out.result.error.as_ref().unwrap().code, ErrorCode::NavigationFailed);
    }

    #[tokio::test]
    async fn test_dispatch_timeout() {
        let driver: Arc<dyn BrowserDriver> = Arc::new(MockBrowserDriver::new());
        let dispatcher = ActionDispatcher::default();
        let env = ActionEnvelope::new("demo", 1, ActionRequest::Wait { seconds: 5.0 }).timeout_ms(50);

        let out = dispatcher.dispatch(&driver, None, &env, false).await;
        assert!(!out.result.success);
        assert_eq!(out.result.error.as_ref().unwrap().code, ErrorCode::ActionTimeout);
    }

    #[tokio::test]
    async fn test_dispatch_fatal_on_driver_crash() {
        let mock = Arc::new(MockBrowserDriver::with_page(login_page()));
        mock.kill();
        let driver: Arc<dyn BrowserDriver> = mock.clone();
        let dispatcher = ActionDispatcher::default();

        let out = dispatcher.dispatch(&driver, None, &click_envelope(0), true).await;
        assert!(!out.result.success);
        assert!(out.fatal);
    }

    #[tokio::test]
    async fn test_dispatch_screenshot_returns_reference() {
        let driver: Arc<dyn BrowserDriver> = Arc::new(MockBrowserDriver::new());
        let dispatcher = ActionDispatcher::default();
        let env = ActionEnvelope::new("demo", 1, ActionRequest::TakeScreenshot);

        let out = dispatcher.dispatch(&driver, None, &env, false).await;
        assert!(out.result.success);
        let data = out.result.observed_effects.data.unwrap();
        assert!(data["screenshot_ref"].as_str().unwrap().starts_with("screenshot-"));
    }

    #[tokio::test]
    async fn test_dispatch_records_delay_samples() {
        let driver: Arc<dyn BrowserDriver> = Arc::new(MockBrowserDriver::with_page(login_page()));
        let dispatcher = ActionDispatcher::default();
        let env = click_envelope(2)
            .trace("screen_id", "screen-login")
            .trace("action_id", "action-submit");

        dispatcher.dispatch(&driver, None, &env, true).await;
        let key = DelayKey::screen_action("screen-login", "action-submit");
        assert_eq!(dispatcher.delay_aggregator().sample_count(&key), 1);
    }

    #[tokio::test]
    async fn test_fill_form_partial_failure_reported() {
        let page = DomSnapshot::from_parts(
            "https://example.com",
            "Form",
            vec![
                DomElement::new("input").name("a"),
                DomElement::new("input").name("b"),
            ],
        );
        let mock = Arc::new(MockBrowserDriver::with_page(page));
        // First field types fine, second fails.
        mock.fail_next(Error::permanent(ErrorCode::SubmissionRejected, "nope"));
        let driver: Arc<dyn BrowserDriver> = mock.clone();
        let dispatcher = ActionDispatcher::default();
        let env = ActionEnvelope::new(
            "demo",
            1,
            ActionRequest::FillForm {
                fields: vec![
                    crate::actions::FormFieldValue { index: 0, value: "x".into() },
                    crate::actions::FormFieldValue { index: 1, value: "y".into() },
                ],
            },
        );

        let out = dispatcher.dispatch(&driver, None, &env, false).await;
        assert!(!out.result.success);
        let body = out.result.error.unwrap();
        assert_eq!(body.code, ErrorCode::SubmissionRejected);
        assert!(body.message.contains("\"success\":false") || body.message.contains("partial"));
    }
}
