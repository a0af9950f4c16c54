//! Action Vocabulary
//!
//! This module defines the closed set of runtime actions an agent can request
//! against a session:
//! - `ActionRequest` - Tagged action variants with typed parameter records
//! - `Target` - Index- or coordinate-addressed element reference
//! - `SpecialKey` / `MouseButton` / `ScrollDirection` - Input enums
//!
//! Parameters are validated at the system boundary via [`ActionRequest::validate`];
//! downstream code can assume a validated request.

use serde::{Deserialize, Serialize};

use crate::dom::BBox;
use crate::error::{Error, Result};

// =============================================================================
// TARGETS & INPUT ENUMS
// =============================================================================

/// A point in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Element reference: either a snapshot index or a viewport coordinate.
/// Exactly one must be present.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coord: Option<Point>,
}

impl Target {
    /// Target by snapshot index
    pub fn index(index: usize) -> Self {
        Self { index: Some(index), coord: None }
    }

    /// Target by viewport coordinate
    pub fn coord(x: f64, y: f64) -> Self {
        Self { index: None, coord: Some(Point::new(x, y)) }
    }

    fn validate(&self, what: &str) -> Result<()> {
        match (self.index, self.coord) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(Error::invalid_params(format!(
                "{}: exactly one of index or coord required",
                what
            ))),
        }
    }
}

/// Mouse button for click actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// Scroll direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Special keys accepted by `send_keys`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialKey {
    Enter,
    Escape,
    Tab,
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    PageUp,
    PageDown,
    Backspace,
    Delete,
    Home,
    End,
}

/// Clipboard operation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipboardOp {
    SelectAll,
    Copy,
    Paste,
    Cut,
}

/// One field assignment inside `fill_form`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormFieldValue {
    pub index: usize,
    pub value: String,
}

/// Dropdown option selector: exactly one of the three must be present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OptionSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_index: Option<usize>,
}

impl OptionSelector {
    pub fn by_value(value: impl Into<String>) -> Self {
        Self { value: Some(value.into()), ..Default::default() }
    }

    pub fn by_text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), ..Default::default() }
    }

    pub fn by_index(option_index: usize) -> Self {
        Self { option_index: Some(option_index), ..Default::default() }
    }

    fn present_count(&self) -> usize {
        [self.value.is_some(), self.text.is_some(), self.option_index.is_some()]
            .iter()
            .filter(|b| **b)
            .count()
    }
}

fn default_char_delay_ms() -> u64 { 75 }

// =============================================================================
// ACTION REQUEST
// =============================================================================

/// Tagged action request. Wire shape is
/// `{"action_type": "<tag>", "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", content = "params", rename_all = "snake_case")]
pub enum ActionRequest {
    Navigate {
        url: String,
        #[serde(default)]
        new_tab: bool,
    },
    Click {
        #[serde(flatten)]
        target: Target,
        #[serde(default)]
        button: MouseButton,
    },
    RightClick {
        #[serde(flatten)]
        target: Target,
    },
    DoubleClick {
        #[serde(flatten)]
        target: Target,
    },
    Hover {
        #[serde(flatten)]
        target: Target,
    },
    #[serde(rename = "type")]
    Type {
        text: String,
        #[serde(default)]
        index: Option<usize>,
    },
    TypeSlowly {
        text: String,
        #[serde(default)]
        index: Option<usize>,
        #[serde(default = "default_char_delay_ms")]
        delay_ms: u64,
    },
    Clear {
        #[serde(default)]
        index: Option<usize>,
    },
    SelectAll {
        #[serde(default)]
        index: Option<usize>,
    },
    Copy {
        #[serde(default)]
        index: Option<usize>,
    },
    Paste {
        #[serde(default)]
        index: Option<usize>,
    },
    Cut {
        #[serde(default)]
        index: Option<usize>,
    },
    Scroll {
        direction: ScrollDirection,
        amount: f64,
    },
    AnimateScroll {
        direction: ScrollDirection,
        amount: f64,
        duration_ms: u64,
    },
    SendKeys {
        keys: Vec<SpecialKey>,
        #[serde(default)]
        index: Option<usize>,
    },
    KeyboardShortcut {
        keys: String,
        #[serde(default)]
        index: Option<usize>,
    },
    Wait {
        seconds: f64,
    },
    GoBack,
    GoForward,
    Refresh,
    DragDrop {
        start: Target,
        end: Target,
    },
    UploadFile {
        file_path: String,
        #[serde(default)]
        index: Option<usize>,
    },
    SelectDropdown {
        index: usize,
        #[serde(flatten)]
        option: OptionSelector,
    },
    FillForm {
        fields: Vec<FormFieldValue>,
    },
    SelectMultiple {
        index: usize,
        values: Vec<String>,
    },
    SubmitForm {
        #[serde(default)]
        index: Option<usize>,
    },
    ResetForm {
        #[serde(default)]
        index: Option<usize>,
    },
    PlayVideo {
        #[serde(default)]
        index: Option<usize>,
    },
    PauseVideo {
        #[serde(default)]
        index: Option<usize>,
    },
    SeekVideo {
        #[serde(default)]
        index: Option<usize>,
        time: f64,
    },
    AdjustVolume {
        #[serde(default)]
        index: Option<usize>,
        volume: f64,
    },
    ToggleFullscreen {
        #[serde(default)]
        index: Option<usize>,
    },
    ToggleMute {
        #[serde(default)]
        index: Option<usize>,
    },
    TakeScreenshot,
    MultiSelect {
        indices: Vec<usize>,
    },
    HighlightElement {
        index: usize,
        #[serde(default)]
        color: Option<String>,
    },
    HighlightRegion {
        region: BBox,
        #[serde(default)]
        color: Option<String>,
    },
    DrawOnPage {
        points: Vec<Point>,
        #[serde(default)]
        color: Option<String>,
    },
    ZoomIn,
    ZoomOut,
    ZoomReset,
    DownloadFile {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        index: Option<usize>,
    },
    PresentationMode {
        #[serde(default)]
        enabled: bool,
    },
    ShowPointer {
        #[serde(default)]
        enabled: bool,
    },
    FocusElement {
        index: usize,
    },
}

impl ActionRequest {
    /// Wire tag for this action.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::RightClick { .. } => "right_click",
            Self::DoubleClick { .. } => "double_click",
            Self::Hover { .. } => "hover",
            Self::Type { .. } => "type",
            Self::TypeSlowly { .. } => "type_slowly",
            Self::Clear { .. } => "clear",
            Self::SelectAll { .. } => "select_all",
            Self::Copy { .. } => "copy",
            Self::Paste { .. } => "paste",
            Self::Cut { .. } => "cut",
            Self::Scroll { .. } => "scroll",
            Self::AnimateScroll { .. } => "animate_scroll",
            Self::SendKeys { .. } => "send_keys",
            Self::KeyboardShortcut { .. } => "keyboard_shortcut",
            Self::Wait { .. } => "wait",
            Self::GoBack => "go_back",
            Self::GoForward => "go_forward",
            Self::Refresh => "refresh",
            Self::DragDrop { .. } => "drag_drop",
            Self::UploadFile { .. } => "upload_file",
            Self::SelectDropdown { .. } => "select_dropdown",
            Self::FillForm { .. } => "fill_form",
            Self::SelectMultiple { .. } => "select_multiple",
            Self::SubmitForm { .. } => "submit_form",
            Self::ResetForm { .. } => "reset_form",
            Self::PlayVideo { .. } => "play_video",
            Self::PauseVideo { .. } => "pause_video",
            Self::SeekVideo { .. } => "seek_video",
            Self::AdjustVolume { .. } => "adjust_volume",
            Self::ToggleFullscreen { .. } => "toggle_fullscreen",
            Self::ToggleMute { .. } => "toggle_mute",
            Self::TakeScreenshot => "take_screenshot",
            Self::MultiSelect { .. } => "multi_select",
            Self::HighlightElement { .. } => "highlight_element",
            Self::HighlightRegion { .. } => "highlight_region",
            Self::DrawOnPage { .. } => "draw_on_page",
            Self::ZoomIn => "zoom_in",
            Self::ZoomOut => "zoom_out",
            Self::ZoomReset => "zoom_reset",
            Self::DownloadFile { .. } => "download_file",
            Self::PresentationMode { .. } => "presentation_mode",
            Self::ShowPointer { .. } => "show_pointer",
            Self::FocusElement { .. } => "focus_element",
        }
    }

    /// Whether re-running the action has no further observable effect.
    pub fn is_idempotent(&self) -> bool {
        !matches!(
            self,
            Self::Click { .. }
                | Self::Type { .. }
                | Self::TypeSlowly { .. }
                | Self::DragDrop { .. }
                | Self::UploadFile { .. }
                | Self::SelectDropdown { .. }
                | Self::FillForm { .. }
                | Self::SelectMultiple { .. }
                | Self::SubmitForm { .. }
                | Self::ResetForm { .. }
                | Self::DownloadFile { .. }
        )
    }

    /// Whether the action can mutate the DOM (decides pre/post snapshotting).
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Self::Hover { .. }
                | Self::Wait { .. }
                | Self::TakeScreenshot
                | Self::HighlightElement { .. }
                | Self::HighlightRegion { .. }
                | Self::DrawOnPage { .. }
                | Self::ShowPointer { .. }
                | Self::Copy { .. }
                | Self::SelectAll { .. }
        )
    }

    /// The snapshot index this action targets, when index-addressed.
    pub fn target_index(&self) -> Option<usize> {
        match self {
            Self::Click { target, .. }
            | Self::RightClick { target }
            | Self::DoubleClick { target }
            | Self::Hover { target } => target.index,
            Self::Type { index, .. }
            | Self::TypeSlowly { index, .. }
            | Self::Clear { index }
            | Self::SelectAll { index }
            | Self::Copy { index }
            | Self::Paste { index }
            | Self::Cut { index }
            | Self::SendKeys { index, .. }
            | Self::KeyboardShortcut { index, .. }
            | Self::UploadFile { index, .. }
            | Self::SubmitForm { index }
            | Self::ResetForm { index }
            | Self::PlayVideo { index }
            | Self::PauseVideo { index }
            | Self::SeekVideo { index, .. }
            | Self::AdjustVolume { index, .. }
            | Self::ToggleFullscreen { index }
            | Self::ToggleMute { index }
            | Self::DownloadFile { index, .. } => *index,
            Self::SelectDropdown { index, .. }
            | Self::SelectMultiple { index, .. }
            | Self::HighlightElement { index, .. }
            | Self::FocusElement { index } => Some(*index),
            _ => None,
        }
    }

    /// Validate parameter invariants. Runs at the system boundary; handlers
    /// assume a validated request.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Navigate { url, .. } => {
                if url.trim().is_empty() {
                    return Err(Error::invalid_params("navigate: url must be non-empty"));
                }
            }
            Self::Click { target, .. } => target.validate("click")?,
            Self::RightClick { target } => target.validate("right_click")?,
            Self::DoubleClick { target } => target.validate("double_click")?,
            Self::Hover { target } => target.validate("hover")?,
            Self::DragDrop { start, end } => {
                start.validate("drag_drop.start")?;
                end.validate("drag_drop.end")?;
            }
            Self::SelectDropdown { option, .. } => {
                if option.present_count() != 1 {
                    return Err(Error::invalid_params(
                        "select_dropdown: exactly one of value, text, option_index required",
                    ));
                }
            }
            Self::DownloadFile { url, index } => {
                if url.is_some() == index.is_some() {
                    return Err(Error::invalid_params(
                        "download_file: exactly one of url or index required",
                    ));
                }
            }
            Self::AdjustVolume { volume, .. } => {
                if !(0.0..=1.0).contains(volume) {
                    return Err(Error::invalid_params("adjust_volume: volume must be in [0, 1]"));
                }
            }
            Self::SeekVideo { time, .. } => {
                if *time < 0.0 {
                    return Err(Error::invalid_params("seek_video: time must be >= 0"));
                }
            }
            Self::Wait { seconds } => {
                if *seconds < 0.0 {
                    return Err(Error::invalid_params("wait: seconds must be >= 0"));
                }
            }
            Self::Scroll { amount, .. } | Self::AnimateScroll { amount, .. } => {
                if *amount < 0.0 {
                    return Err(Error::invalid_params("scroll: amount must be >= 0"));
                }
            }
            Self::FillForm { fields } => {
                if fields.is_empty() {
                    return Err(Error::invalid_params("fill_form: fields must be non-empty"));
                }
            }
            Self::SelectMultiple { values, .. } => {
                if values.is_empty() {
                    return Err(Error::invalid_params("select_multiple: values must be non-empty"));
                }
            }
            Self::MultiSelect { indices } => {
                if indices.is_empty() {
                    return Err(Error::invalid_params("multi_select: indices must be non-empty"));
                }
            }
            Self::SendKeys { keys, .. } => {
                if keys.is_empty() {
                    return Err(Error::invalid_params("send_keys: keys must be non-empty"));
                }
            }
            Self::KeyboardShortcut { keys, .. } => {
                if keys.trim().is_empty() {
                    return Err(Error::invalid_params("keyboard_shortcut: keys must be non-empty"));
                }
            }
            Self::UploadFile { file_path, .. } => {
                if file_path.trim().is_empty() {
                    return Err(Error::invalid_params("upload_file: file_path must be non-empty"));
                }
            }
            Self::TypeSlowly { delay_ms, .. } => {
                if *delay_ms == 0 {
                    return Err(Error::invalid_params("type_slowly: delay_ms must be > 0"));
                }
            }
            Self::DrawOnPage { points, .. } => {
                if points.len() < 2 {
                    return Err(Error::invalid_params("draw_on_page: at least two points required"));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let action = ActionRequest::Click {
            target: Target::index(3),
            button: MouseButton::Left,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action_type"], "click");
        assert_eq!(json["params"]["index"], 3);
    }

    #[test]
    fn test_type_tag_rename() {
        let action: ActionRequest = serde_json::from_value(serde_json::json!({
            "action_type": "type",
            "params": {"text": "alice", "index": 0}
        }))
        .unwrap();
        assert_eq!(action.tag(), "type");
        assert!(matches!(action, ActionRequest::Type { .. }));
    }

    #[test]
    fn test_unit_variant_roundtrip() {
        let action: ActionRequest =
            serde_json::from_value(serde_json::json!({"action_type": "go_back"})).unwrap();
        assert_eq!(action, ActionRequest::GoBack);
    }

    #[test]
    fn test_unknown_action_type_rejected() {
        let result: std::result::Result<ActionRequest, _> =
            serde_json::from_value(serde_json::json!({"action_type": "teleport", "params": {}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_target_exactly_one() {
        let action = ActionRequest::Click { target: Target::default(), button: MouseButton::Left };
        assert!(action.validate().is_err());

        let action = ActionRequest::Click {
            target: Target { index: Some(1), coord: Some(Point::new(1.0, 2.0)) },
            button: MouseButton::Left,
        };
        assert!(action.validate().is_err());

        let action = ActionRequest::Click { target: Target::coord(10.0, 20.0), button: MouseButton::Left };
        assert!(action.validate().is_ok());
    }

    #[test]
    fn test_select_dropdown_exactly_one() {
        let ok = ActionRequest::SelectDropdown {
            index: 2,
            option: OptionSelector::by_text("Canada"),
        };
        assert!(ok.validate().is_ok());

        let none = ActionRequest::SelectDropdown { index: 2, option: OptionSelector::default() };
        assert!(none.validate().is_err());

        let both = ActionRequest::SelectDropdown {
            index: 2,
            option: OptionSelector {
                value: Some("ca".into()),
                text: Some("Canada".into()),
                option_index: None,
            },
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_download_file_exactly_one() {
        let ok = ActionRequest::DownloadFile { url: Some("https://example.com/a.pdf".into()), index: None };
        assert!(ok.validate().is_ok());

        let neither = ActionRequest::DownloadFile { url: None, index: None };
        assert!(neither.validate().is_err());

        let both = ActionRequest::DownloadFile { url: Some("x".into()), index: Some(1) };
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_volume_range() {
        let ok = ActionRequest::AdjustVolume { index: None, volume: 0.5 };
        assert!(ok.validate().is_ok());

        let too_loud = ActionRequest::AdjustVolume { index: None, volume: 1.5 };
        assert!(too_loud.validate().is_err());
    }

    #[test]
    fn test_idempotency_flags() {
        assert!(ActionRequest::Navigate { url: "https://example.com".into(), new_tab: false }
            .is_idempotent());
        assert!(ActionRequest::Scroll { direction: ScrollDirection::Down, amount: 100.0 }
            .is_idempotent());
        assert!(!ActionRequest::Click { target: Target::index(0), button: MouseButton::Left }
            .is_idempotent());
        assert!(!ActionRequest::SubmitForm { index: None }.is_idempotent());
    }

    #[test]
    fn test_target_index_extraction() {
        let action = ActionRequest::Type { text: "hi".into(), index: Some(4) };
        assert_eq!(action.target_index(), Some(4));

        let action = ActionRequest::GoBack;
        assert_eq!(action.target_index(), None);
    }

    #[test]
    fn test_mutating_flags() {
        assert!(ActionRequest::Click { target: Target::index(0), button: MouseButton::Left }
            .is_mutating());
        assert!(!ActionRequest::TakeScreenshot.is_mutating());
        assert!(!ActionRequest::Hover { target: Target::index(0) }.is_mutating());
    }
}
