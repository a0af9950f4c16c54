//! State Diff Engine
//!
//! Computes a structured [`StateDiff`] between a pre-action and post-action
//! [`DomSnapshot`], then synthesizes semantic events from the deltas with a
//! closed, rule-based vocabulary. Rules are additive and deterministic: the
//! same pair of snapshots always yields the same events in the same order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::dom::{DomElement, DomSnapshot, ElementSignature, ValidationState};

// =============================================================================
// DIFF VALUE TYPES
// =============================================================================

/// Wire format version of the diff structure
pub const DIFF_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    #[default]
    Incremental,
    Full,
}

/// An element present in post but not in pre.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddedElement {
    pub index: usize,
    pub selector: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// An element present in pre but not in post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedElement {
    pub index: usize,
    pub selector: String,
    pub tag: String,
}

/// Attribute transition on a surviving element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
}

/// Class-list deltas on a surviving element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassChanges {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

/// Per-element change set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementChanges {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, AttrChange>,
    #[serde(default, skip_serializing_if = "class_changes_empty")]
    pub classes: ClassChanges,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<AttrChange>,
}

fn class_changes_empty(c: &ClassChanges) -> bool {
    c.added.is_empty() && c.removed.is_empty()
}

impl ElementChanges {
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty() && class_changes_empty(&self.classes) && self.text.is_none()
    }
}

/// A surviving element whose attributes, classes, or text changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedElement {
    /// Index in the post snapshot
    pub index: usize,
    pub selector: String,
    pub changes: ElementChanges,
}

/// A surviving element whose index changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovedElement {
    pub from_index: usize,
    pub to_index: usize,
    pub selector: String,
}

/// Element-set deltas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomChanges {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<AddedElement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<RemovedElement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified: Vec<ModifiedElement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub moved: Vec<MovedElement>,
}

impl DomChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && self.moved.is_empty()
    }
}

/// URL/title transitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationChanges {
    pub url_changed: bool,
    pub title_changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One field whose state changed within a form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_state: Option<ValidationState>,
    #[serde(default)]
    pub value_changed: bool,
}

/// Validation-state transitions within one form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormStateChange {
    pub form_index: usize,
    pub fields_changed: Vec<FieldChange>,
    pub form_valid: bool,
}

/// Focus transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FocusChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_index: Option<usize>,
}

/// Accessibility deltas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessibilityChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_changed: Option<FocusChange>,
}

// =============================================================================
// SEMANTIC EVENTS
// =============================================================================

/// Closed semantic-event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticEventType {
    // Navigation
    PageLoadComplete,
    ClientSideRoute,
    HashChange,
    // UI state
    ModalOpened,
    ModalClosed,
    DropdownExpanded,
    TabSwitched,
    // Form
    FormSubmitted,
    ValidationError,
    FieldFocused,
    // Feedback
    ErrorBannerAppeared,
    SuccessMessageAppeared,
    ToastNotification,
    // Auth
    LoginSuccess,
    LoginFailure,
    // Data
    ListUpdated,
    TableSorted,
    PaginationChanged,
}

impl SemanticEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PageLoadComplete => "page_load_complete",
            Self::ClientSideRoute => "client_side_route",
            Self::HashChange => "hash_change",
            Self::ModalOpened => "modal_opened",
            Self::ModalClosed => "modal_closed",
            Self::DropdownExpanded => "dropdown_expanded",
            Self::TabSwitched => "tab_switched",
            Self::FormSubmitted => "form_submitted",
            Self::ValidationError => "validation_error",
            Self::FieldFocused => "field_focused",
            Self::ErrorBannerAppeared => "error_banner_appeared",
            Self::SuccessMessageAppeared => "success_message_appeared",
            Self::ToastNotification => "toast_notification",
            Self::LoginSuccess => "login_success",
            Self::LoginFailure => "login_failure",
            Self::ListUpdated => "list_updated",
            Self::TableSorted => "table_sorted",
            Self::PaginationChanged => "pagination_changed",
        }
    }
}

/// One synthesized semantic event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticEvent {
    pub event_type: SemanticEventType,
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_selector: Option<String>,
    pub confidence: f64,
}

impl SemanticEvent {
    fn new(event_type: SemanticEventType, confidence: f64) -> Self {
        Self {
            event_type,
            event_name: event_type.as_str().to_string(),
            target_selector: None,
            confidence,
        }
    }

    fn target(mut self, selector: impl Into<String>) -> Self {
        self.target_selector = Some(selector.into());
        self
    }
}

// =============================================================================
// STATE DIFF
// =============================================================================

/// Structured description of what changed between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    pub format_version: u32,
    pub diff_type: DiffType,
    pub pre_hash: String,
    pub post_hash: String,
    pub dom_changes: DomChanges,
    pub navigation_changes: NavigationChanges,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub form_state_changes: Vec<FormStateChange>,
    pub accessibility_changes: AccessibilityChanges,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub semantic_events: Vec<SemanticEvent>,
}

impl StateDiff {
    /// Whether nothing observable changed.
    pub fn is_empty(&self) -> bool {
        self.dom_changes.is_empty()
            && !self.navigation_changes.url_changed
            && !self.navigation_changes.title_changed
            && self.form_state_changes.is_empty()
            && self.accessibility_changes.focus_changed.is_none()
            && self.semantic_events.is_empty()
    }

    /// Events of a given type
    pub fn events_of(&self, event_type: SemanticEventType) -> Vec<&SemanticEvent> {
        self.semantic_events.iter().filter(|e| e.event_type == event_type).collect()
    }
}

/// Pairing of surviving elements between two snapshots.
struct ElementMatch {
    pre_index: usize,
    post_index: usize,
}

/// Signature-based bipartite matching: the k-th pre occurrence of a signature
/// pairs with the k-th post occurrence. The stable ordering makes added vs.
/// moved classification deterministic.
fn match_elements(pre: &DomSnapshot, post: &DomSnapshot) -> (Vec<ElementMatch>, Vec<usize>, Vec<usize>) {
    let mut post_by_sig: HashMap<ElementSignature, Vec<usize>> = HashMap::new();
    for el in &post.elements {
        post_by_sig.entry(el.signature()).or_default().push(el.index);
    }

    let mut matches = Vec::new();
    let mut removed = Vec::new();
    let mut consumed: HashMap<ElementSignature, usize> = HashMap::new();

    for el in &pre.elements {
        let sig = el.signature();
        let rank = consumed.entry(sig.clone()).or_insert(0);
        match post_by_sig.get(&sig).and_then(|idxs| idxs.get(*rank)) {
            Some(&post_index) => {
                matches.push(ElementMatch { pre_index: el.index, post_index });
                *rank += 1;
            }
            None => removed.push(el.index),
        }
    }

    let matched_post: std::collections::HashSet<usize> =
        matches.iter().map(|m| m.post_index).collect();
    let added = post
        .elements
        .iter()
        .map(|e| e.index)
        .filter(|i| !matched_post.contains(i))
        .collect();

    (matches, removed, added)
}

fn attr_change(old: Option<&str>, new: Option<&str>) -> Option<AttrChange> {
    if old != new {
        Some(AttrChange { old: old.map(String::from), new: new.map(String::from) })
    } else {
        None
    }
}

fn element_changes(pre: &DomElement, post: &DomElement) -> ElementChanges {
    let mut changes = ElementChanges::default();

    let pairs = [
        ("id", pre.attributes.id.as_deref(), post.attributes.id.as_deref()),
        ("name", pre.attributes.name.as_deref(), post.attributes.name.as_deref()),
        ("type", pre.attributes.input_type.as_deref(), post.attributes.input_type.as_deref()),
        ("placeholder", pre.attributes.placeholder.as_deref(), post.attributes.placeholder.as_deref()),
        ("value", pre.attributes.value.as_deref(), post.attributes.value.as_deref()),
    ];
    for (key, old, new) in pairs {
        if let Some(change) = attr_change(old, new) {
            changes.attrs.insert(key.to_string(), change);
        }
    }

    let aria_keys: std::collections::BTreeSet<&String> =
        pre.attributes.aria.keys().chain(post.attributes.aria.keys()).collect();
    for key in aria_keys {
        if let Some(change) = attr_change(
            pre.attributes.aria.get(key).map(String::as_str),
            post.attributes.aria.get(key).map(String::as_str),
        ) {
            changes.attrs.insert(key.clone(), change);
        }
    }

    for class in &post.attributes.classes {
        if !pre.attributes.classes.contains(class) {
            changes.classes.added.push(class.clone());
        }
    }
    for class in &pre.attributes.classes {
        if !post.attributes.classes.contains(class) {
            changes.classes.removed.push(class.clone());
        }
    }

    changes.text = attr_change(pre.attributes.text.as_deref(), post.attributes.text.as_deref());
    changes
}

fn form_state_changes(pre: &DomSnapshot, post: &DomSnapshot) -> Vec<FormStateChange> {
    let mut out = Vec::new();
    for post_form in &post.forms {
        let Some(pre_form) = pre.forms.iter().find(|f| f.form_index == post_form.form_index) else {
            continue;
        };
        let mut fields_changed = Vec::new();
        for (pos, post_field) in post_form.fields.iter().enumerate() {
            let Some(pre_field) = pre_form.fields.get(pos) else { continue };
            let validation_changed = pre_field.validation != post_field.validation;
            let value_changed = pre_field.has_value != post_field.has_value;
            if validation_changed || value_changed {
                fields_changed.push(FieldChange {
                    field_index: post_field.index,
                    validation_state: validation_changed.then_some(post_field.validation),
                    value_changed,
                });
            }
        }
        if !fields_changed.is_empty() {
            out.push(FormStateChange {
                form_index: post_form.form_index,
                fields_changed,
                form_valid: post_form.is_valid(),
            });
        }
    }
    out
}

fn focused_index(snapshot: &DomSnapshot) -> Option<usize> {
    snapshot.elements.iter().find(|e| e.focused).map(|e| e.index)
}

fn has_password_field(snapshot: &DomSnapshot) -> bool {
    snapshot
        .elements
        .iter()
        .any(|e| e.attributes.input_type.as_deref() == Some("password"))
}

fn list_item_count(snapshot: &DomSnapshot) -> usize {
    snapshot
        .elements
        .iter()
        .filter(|e| e.tag == "li" || e.role.as_deref() == Some("listitem"))
        .count()
}

fn url_fragment_only_change(pre: &str, post: &str) -> bool {
    let strip = |u: &str| u.split('#').next().unwrap_or("").to_string();
    pre != post && strip(pre) == strip(post)
}

fn url_host(url: &str) -> String {
    url.split("//")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("")
        .to_string()
}

fn has_class_containing(el: &DomElement, needles: &[&str]) -> bool {
    el.attributes
        .classes
        .iter()
        .any(|c| needles.iter().any(|n| c.to_lowercase().contains(n)))
}

/// Compute the structured diff plus semantic events for a snapshot pair.
pub fn diff_snapshots(pre: &DomSnapshot, post: &DomSnapshot) -> StateDiff {
    let (matches, removed_indices, added_indices) = match_elements(pre, post);

    let mut dom_changes = DomChanges::default();
    for i in &added_indices {
        let el = &post.elements[*i];
        dom_changes.added.push(AddedElement {
            index: el.index,
            selector: el.css_selector(),
            tag: el.tag.clone(),
            role: el.role.clone(),
            text: el.attributes.text.clone(),
        });
    }
    for i in &removed_indices {
        let el = &pre.elements[*i];
        dom_changes.removed.push(RemovedElement {
            index: el.index,
            selector: el.css_selector(),
            tag: el.tag.clone(),
        });
    }
    for m in &matches {
        let pre_el = &pre.elements[m.pre_index];
        let post_el = &post.elements[m.post_index];
        if m.pre_index != m.post_index {
            dom_changes.moved.push(MovedElement {
                from_index: m.pre_index,
                to_index: m.post_index,
                selector: post_el.css_selector(),
            });
        }
        let changes = element_changes(pre_el, post_el);
        if !changes.is_empty() {
            dom_changes.modified.push(ModifiedElement {
                index: post_el.index,
                selector: post_el.css_selector(),
                changes,
            });
        }
    }

    let url_changed = pre.url != post.url;
    let title_changed = pre.title != post.title;
    let navigation_changes = NavigationChanges {
        url_changed,
        title_changed,
        url: url_changed.then(|| post.url.clone()),
        title: title_changed.then(|| post.title.clone()),
    };

    let form_changes = form_state_changes(pre, post);

    let pre_focus = focused_index(pre);
    let post_focus = focused_index(post);
    let accessibility_changes = AccessibilityChanges {
        focus_changed: (pre_focus != post_focus)
            .then_some(FocusChange { from_index: pre_focus, to_index: post_focus }),
    };

    let semantic_events = synthesize_events(
        pre,
        post,
        &dom_changes,
        &navigation_changes,
        &form_changes,
        &accessibility_changes,
    );

    StateDiff {
        format_version: DIFF_FORMAT_VERSION,
        diff_type: DiffType::Incremental,
        pre_hash: pre.content_hash.clone(),
        post_hash: post.content_hash.clone(),
        dom_changes,
        navigation_changes,
        form_state_changes: form_changes,
        accessibility_changes,
        semantic_events,
    }
}

/// Rule-based semantic event synthesis. Rules run in a fixed order; each
/// pushes zero or more events, so output order is deterministic.
fn synthesize_events(
    pre: &DomSnapshot,
    post: &DomSnapshot,
    dom: &DomChanges,
    nav: &NavigationChanges,
    forms: &[FormStateChange],
    a11y: &AccessibilityChanges,
) -> Vec<SemanticEvent> {
    use SemanticEventType as E;
    let mut events = Vec::new();

    // Navigation family: one of hash_change / page_load_complete /
    // client_side_route per url transition.
    if nav.url_changed {
        if url_fragment_only_change(&pre.url, &post.url) {
            events.push(SemanticEvent::new(E::HashChange, 0.95));
        } else if url_host(&pre.url) != url_host(&post.url)
            || pre.ready_state != crate::dom::ReadyState::Complete
        {
            events.push(SemanticEvent::new(E::PageLoadComplete, 0.9));
        } else {
            events.push(SemanticEvent::new(E::ClientSideRoute, 0.75));
        }
    } else if pre.ready_state != crate::dom::ReadyState::Complete
        && post.ready_state == crate::dom::ReadyState::Complete
    {
        events.push(SemanticEvent::new(E::PageLoadComplete, 0.85));
    }

    // Modal open/close
    for added in &dom.added {
        let el = &post.elements[added.index];
        if el.role.as_deref() == Some("dialog") || has_class_containing(el, &["modal"]) {
            events.push(SemanticEvent::new(E::ModalOpened, 0.85).target(added.selector.clone()));
        }
    }
    for removed in &dom.removed {
        let el = &pre.elements[removed.index];
        if el.role.as_deref() == Some("dialog") || has_class_containing(el, &["modal"]) {
            events.push(SemanticEvent::new(E::ModalClosed, 0.85).target(removed.selector.clone()));
        }
    }

    // Dropdown / tab state from aria transitions
    for modified in &dom.modified {
        if let Some(change) = modified.changes.attrs.get("aria-expanded") {
            if change.old.as_deref() != Some("true") && change.new.as_deref() == Some("true") {
                events.push(
                    SemanticEvent::new(E::DropdownExpanded, 0.8).target(modified.selector.clone()),
                );
            }
        }
        if let Some(change) = modified.changes.attrs.get("aria-selected") {
            let el = &post.elements[modified.index];
            if el.role.as_deref() == Some("tab") && change.new.as_deref() == Some("true") {
                events.push(
                    SemanticEvent::new(E::TabSwitched, 0.8).target(modified.selector.clone()),
                );
            }
        }
    }

    // Form submission: a form existed before and either navigation happened
    // or its fields left the DOM.
    if !pre.forms.is_empty() {
        let pre_field_indices: std::collections::HashSet<usize> =
            pre.forms.iter().flat_map(|f| f.fields.iter().map(|fld| fld.index)).collect();
        let fields_removed = dom.removed.iter().any(|r| pre_field_indices.contains(&r.index));
        if nav.url_changed || fields_removed {
            events.push(SemanticEvent::new(E::FormSubmitted, 0.7));
        }
    }

    // Validation errors
    for form in forms {
        if form
            .fields_changed
            .iter()
            .any(|f| f.validation_state == Some(ValidationState::Invalid))
        {
            events.push(SemanticEvent::new(E::ValidationError, 0.85));
        }
    }

    // Focus into a text input
    if let Some(focus) = &a11y.focus_changed {
        if let Some(to) = focus.to_index {
            if post.elements.get(to).map(|e| e.is_text_input()).unwrap_or(false) {
                events.push(
                    SemanticEvent::new(E::FieldFocused, 0.9)
                        .target(post.elements[to].css_selector()),
                );
            }
        }
    }

    // Feedback surfaces
    let mut error_appeared = false;
    for added in &dom.added {
        let el = &post.elements[added.index];
        if el.role.as_deref() == Some("alert") || has_class_containing(el, &["error", "alert-danger"]) {
            error_appeared = true;
            events.push(
                SemanticEvent::new(E::ErrorBannerAppeared, 0.85).target(added.selector.clone()),
            );
        } else if has_class_containing(el, &["success", "alert-success"]) {
            events.push(
                SemanticEvent::new(E::SuccessMessageAppeared, 0.8).target(added.selector.clone()),
            );
        } else if has_class_containing(el, &["toast", "snackbar"]) {
            events.push(
                SemanticEvent::new(E::ToastNotification, 0.75).target(added.selector.clone()),
            );
        }
    }

    // Auth outcome
    let pre_password = has_password_field(pre);
    let post_password = has_password_field(post);
    if pre_password && !post_password && nav.url_changed {
        events.push(SemanticEvent::new(E::LoginSuccess, 0.9));
    } else if pre_password && post_password {
        let validation_failed = events.iter().any(|e| e.event_type == E::ValidationError);
        if error_appeared || validation_failed {
            events.push(SemanticEvent::new(E::LoginFailure, 0.85));
        }
    }

    // Data surfaces
    if !nav.url_changed && list_item_count(pre) != list_item_count(post) {
        events.push(SemanticEvent::new(E::ListUpdated, 0.7));
    }
    for modified in &dom.modified {
        if modified.changes.attrs.contains_key("aria-sort") {
            events.push(SemanticEvent::new(E::TableSorted, 0.8).target(modified.selector.clone()));
        }
        if let Some(change) = modified.changes.attrs.get("aria-current") {
            if change.new.as_deref() == Some("page") {
                events.push(
                    SemanticEvent::new(E::PaginationChanged, 0.7).target(modified.selector.clone()),
                );
            }
        }
    }

    events
}

// =============================================================================
// TESTS
// =============================================================================
