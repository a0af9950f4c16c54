//! DOM State Model
//!
//! This module provides the index-addressed view of a page at a point in time:
//! - `DomSnapshot` - Immutable snapshot with dense element indices
//! - `DomElement` - One interactive element with attributes and geometry
//! - `ElementSignature` - Stable identity used to remap indices across snapshots
//! - `FormGroup` / `FieldRole` - Detected form structure and semantic roles
//! - `find_form_fields` - Login-field auto-discovery heuristics
//!
//! Indices within a snapshot are contiguous `[0..N)` in capture order. Across
//! snapshots they are not stable; resolution against an older snapshot goes
//! through signature matching.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::ViewportConfig;

// =============================================================================
// GEOMETRY
// =============================================================================

/// Bounding box in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BBox {
    /// Create a new bounding box
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Area in square pixels
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Center point
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Document readiness at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    Loading,
    Interactive,
    #[default]
    Complete,
}

// =============================================================================
// ELEMENT
// =============================================================================

/// Attribute subset captured per element.
///
/// `aria` holds accessibility attributes in sorted order so serialization and
/// hashing stay deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The `type` attribute for inputs/buttons
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    /// Visible text content (trimmed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    /// Label text associated with the element (nearest label)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aria: BTreeMap<String, String>,
    /// Identifier of the owning form, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    #[serde(default)]
    pub readonly: bool,
}

/// One interactive element in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomElement {
    /// Dense zero-based index assigned by capture order
    pub index: usize,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub attributes: ElementAttributes,
    pub bbox: BBox,
    pub visible: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub focused: bool,
}

fn default_enabled() -> bool { true }

impl DomElement {
    /// Create a new element (index is reassigned by the snapshot)
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            index: 0,
            tag: tag.into(),
            role: None,
            attributes: ElementAttributes::default(),
            bbox: BBox::default(),
            visible: true,
            enabled: true,
            focused: false,
        }
    }

    /// Set the ARIA role
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the id attribute
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.attributes.id = Some(id.into());
        self
    }

    /// Set the name attribute
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.attributes.name = Some(name.into());
        self
    }

    /// Set the type attribute
    pub fn input_type(mut self, t: impl Into<String>) -> Self {
        self.attributes.input_type = Some(t.into());
        self
    }

    /// Set the placeholder
    pub fn placeholder(mut self, p: impl Into<String>) -> Self {
        self.attributes.placeholder = Some(p.into());
        self
    }

    /// Set the visible text
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.attributes.text = Some(text.into());
        self
    }

    /// Set the value
    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.attributes.value = Some(value.into());
        self
    }

    /// Set the label text
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.attributes.label = Some(label.into());
        self
    }

    /// Set the href attribute
    pub fn href(mut self, href: impl Into<String>) -> Self {
        self.attributes.href = Some(href.into());
        self
    }

    /// Add a CSS class
    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.attributes.classes.push(class.into());
        self
    }

    /// Set an ARIA attribute
    pub fn aria(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.aria.insert(key.into(), value.into());
        self
    }

    /// Set the owning form id
    pub fn form_id(mut self, id: impl Into<String>) -> Self {
        self.attributes.form_id = Some(id.into());
        self
    }

    /// Set the bounding box
    pub fn bbox(mut self, bbox: BBox) -> Self {
        self.bbox = bbox;
        self
    }

    /// Set visibility
    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    /// Set enabled state
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Mark readonly
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.attributes.readonly = readonly;
        self
    }

    /// Mark focused
    pub fn focused(mut self, focused: bool) -> Self {
        self.focused = focused;
        self
    }

    /// Stable identity for cross-snapshot matching.
    pub fn signature(&self) -> ElementSignature {
        let selector = if let Some(id) = &self.attributes.id {
            format!("#{}", id)
        } else if let Some(name) = &self.attributes.name {
            format!("[name={}]", name)
        } else {
            let text = self.attributes.text.as_deref().unwrap_or("");
            let prefix: String = text.chars().take(32).collect();
            format!("~{}", prefix)
        };
        ElementSignature {
            tag: self.tag.clone(),
            role: self.role.clone(),
            selector,
        }
    }

    /// Best-available CSS selector for diff payloads.
    pub fn css_selector(&self) -> String {
        if let Some(id) = &self.attributes.id {
            format!("#{}", id)
        } else if let Some(name) = &self.attributes.name {
            format!("{}[name=\"{}\"]", self.tag, name)
        } else {
            format!("{}:nth-of-type({})", self.tag, self.index + 1)
        }
    }

    /// Whether this is a text-entry element
    pub fn is_text_input(&self) -> bool {
        match self.tag.as_str() {
            "textarea" => true,
            "input" => !matches!(
                self.attributes.input_type.as_deref(),
                Some("submit") | Some("button") | Some("checkbox") | Some("radio") | Some("file")
            ),
            _ => self.role.as_deref() == Some("textbox"),
        }
    }

    /// Whether the element looks like an input in error state
    pub fn has_error_state(&self) -> bool {
        self.attributes.aria.get("aria-invalid").map(|v| v == "true").unwrap_or(false)
            || self.attributes.classes.iter().any(|c| c.contains("error") || c.contains("invalid"))
    }

    /// Line contributed to the snapshot content hash.
    fn hash_line(&self) -> String {
        let text = self.attributes.text.as_deref().unwrap_or("");
        let prefix: String = text.chars().take(32).collect();
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.tag,
            self.role.as_deref().unwrap_or(""),
            self.attributes.id.as_deref().unwrap_or(""),
            self.attributes.name.as_deref().unwrap_or(""),
            self.attributes.input_type.as_deref().unwrap_or(""),
            prefix,
        )
    }
}

/// Stable element identity: (tag, role, selector signature).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementSignature {
    pub tag: String,
    pub role: Option<String>,
    pub selector: String,
}

// =============================================================================
// FORMS
// =============================================================================

/// Semantic role detected for a form field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    Username,
    Email,
    Password,
    Submit,
    Search,
    Checkbox,
    Radio,
    File,
    Select,
    Generic,
}

/// Validation state of a field at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    #[default]
    Unknown,
    Valid,
    Invalid,
}

/// One field inside a detected form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    /// Element index of the field
    pub index: usize,
    pub role: FieldRole,
    /// Whether the field currently has a value
    pub has_value: bool,
    pub validation: ValidationState,
}

/// A detected form group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormGroup {
    /// Zero-based form index in detection order
    pub form_index: usize,
    /// Owning form id when known
    pub form_id: Option<String>,
    pub fields: Vec<FormField>,
    /// Element index of the submit control, when detected
    pub submit_index: Option<usize>,
}

impl FormGroup {
    /// A form is valid when no field is in the invalid state
    pub fn is_valid(&self) -> bool {
        self.fields.iter().all(|f| f.validation != ValidationState::Invalid)
    }
}

/// Result of login-field auto-discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FormFieldMatch {
    pub username_index: Option<usize>,
    pub password_index: Option<usize>,
    pub submit_index: Option<usize>,
}

/// Detect the semantic role of an element.
pub fn detect_field_role(el: &DomElement) -> FieldRole {
    let input_type = el.attributes.input_type.as_deref().unwrap_or("");
    match input_type {
        "email" => return FieldRole::Email,
        "password" => return FieldRole::Password,
        "submit" => return FieldRole::Submit,
        "checkbox" => return FieldRole::Checkbox,
        "radio" => return FieldRole::Radio,
        "file" => return FieldRole::File,
        "search" => return FieldRole::Search,
        _ => {}
    }
    if el.tag == "select" {
        return FieldRole::Select;
    }
    if el.tag == "button" {
        return FieldRole::Submit;
    }

    let haystack = [
        el.attributes.name.as_deref(),
        el.attributes.id.as_deref(),
        el.attributes.placeholder.as_deref(),
        el.attributes.label.as_deref(),
    ]
    .iter()
    .flatten()
    .map(|s| s.to_lowercase())
    .collect::<Vec<_>>()
    .join(" ");

    if ["email"].iter().any(|k| haystack.contains(k)) {
        FieldRole::Email
    } else if ["password", "passwd"].iter().any(|k| haystack.contains(k)) {
        FieldRole::Password
    } else if ["username", "user", "login", "account"].iter().any(|k| haystack.contains(k)) {
        FieldRole::Username
    } else {
        FieldRole::Generic
    }
}

fn detect_forms(elements: &[DomElement]) -> Vec<FormGroup> {
    // Group fields by owning form id; fields with no form id fall into one
    // implicit group when any form-shaped element exists.
    let mut groups: Vec<(Option<String>, Vec<usize>)> = Vec::new();
    for el in elements {
        let is_field = el.is_text_input()
            || el.tag == "select"
            || matches!(
                el.attributes.input_type.as_deref(),
                Some("checkbox") | Some("radio") | Some("file") | Some("submit")
            )
            || el.tag == "button";
        if !is_field {
            continue;
        }
        let key = el.attributes.form_id.clone();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, idxs)) => idxs.push(el.index),
            None => groups.push((key, vec![el.index])),
        }
    }

    groups
        .into_iter()
        .enumerate()
        .map(|(form_index, (form_id, idxs))| {
            let mut fields = Vec::new();
            let mut submit_index = None;
            for &i in &idxs {
                let el = &elements[i];
                let role = detect_field_role(el);
                if role == FieldRole::Submit {
                    if submit_index.is_none() {
                        submit_index = Some(i);
                    }
                    continue;
                }
                let validation = if el.has_error_state() {
                    ValidationState::Invalid
                } else if el.attributes.aria.get("aria-invalid").map(|v| v == "false").unwrap_or(false) {
                    ValidationState::Valid
                } else {
                    ValidationState::Unknown
                };
                fields.push(FormField {
                    index: i,
                    role,
                    has_value: el.attributes.value.as_deref().map(|v| !v.is_empty()).unwrap_or(false),
                    validation,
                });
            }
            FormGroup { form_index, form_id, fields, submit_index }
        })
        .collect()
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Immutable, index-addressed view of a page at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub url: String,
    pub title: String,
    pub ready_state: ReadyState,
    pub scroll_x: f64,
    pub scroll_y: f64,
    pub cursor_x: f64,
    pub cursor_y: f64,
    pub viewport: ViewportConfig,
    pub elements: Vec<DomElement>,
    pub forms: Vec<FormGroup>,
    /// SHA-256 hex over (url, ordered element signatures)
    pub content_hash: String,
    /// Capture time in ms since epoch
    pub captured_at_ms: u64,
}

impl DomSnapshot {
    /// Build a snapshot from captured parts. Element indices are reassigned
    /// to be contiguous in the given order; forms and the content hash are
    /// derived here.
    pub fn from_parts(
        url: impl Into<String>,
        title: impl Into<String>,
        mut elements: Vec<DomElement>,
    ) -> Self {
        for (i, el) in elements.iter_mut().enumerate() {
            el.index = i;
        }
        let url = url.into();
        let forms = detect_forms(&elements);
        let content_hash = compute_content_hash(&url, &elements);
        Self {
            url,
            title: title.into(),
            ready_state: ReadyState::Complete,
            scroll_x: 0.0,
            scroll_y: 0.0,
            cursor_x: 0.0,
            cursor_y: 0.0,
            viewport: ViewportConfig::default(),
            elements,
            forms,
            content_hash,
            captured_at_ms: crate::now_ms(),
        }
    }

    /// Set the ready state (builder-style, used by drivers)
    pub fn ready_state(mut self, state: ReadyState) -> Self {
        self.ready_state = state;
        self
    }

    /// Set scroll position
    pub fn scrolled(mut self, x: f64, y: f64) -> Self {
        self.scroll_x = x;
        self.scroll_y = y;
        self
    }

    /// O(1) index resolution within this snapshot.
    pub fn element(&self, index: usize) -> Option<&DomElement> {
        self.elements.get(index)
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the snapshot has no elements
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Remap an index from an older snapshot into this one by element
    /// signature. When a signature occurs more than once, the occurrence rank
    /// is preserved so the mapping is deterministic.
    pub fn remap_index(&self, old: &DomSnapshot, old_index: usize) -> Option<usize> {
        let target = old.element(old_index)?;
        let sig = target.signature();
        let rank = old.elements[..old_index]
            .iter()
            .filter(|e| e.signature() == sig)
            .count();
        self.elements
            .iter()
            .filter(|e| e.signature() == sig)
            .nth(rank)
            .map(|e| e.index)
    }

    /// Login-field auto-discovery over this snapshot's elements.
    ///
    /// Priority: explicit `type=email|password|submit`, then semantic keyword
    /// match on name/id/placeholder/label, then button text. Unresolved slots
    /// stay `None`; callers fall back to sending Enter.
    pub fn find_form_fields(&self) -> FormFieldMatch {
        let mut result = FormFieldMatch::default();

        // Pass 1: explicit input types
        for el in &self.elements {
            if !el.visible {
                continue;
            }
            match el.attributes.input_type.as_deref() {
                Some("email") if result.username_index.is_none() => {
                    result.username_index = Some(el.index)
                }
                Some("password") if result.password_index.is_none() => {
                    result.password_index = Some(el.index)
                }
                Some("submit") if result.submit_index.is_none() => {
                    result.submit_index = Some(el.index)
                }
                _ => {}
            }
        }

        // Pass 2: semantic keyword match
        for el in &self.elements {
            if !el.visible || !el.is_text_input() {
                continue;
            }
            match detect_field_role(el) {
                FieldRole::Email | FieldRole::Username if result.username_index.is_none() => {
                    result.username_index = Some(el.index)
                }
                FieldRole::Password if result.password_index.is_none() => {
                    result.password_index = Some(el.index)
                }
                _ => {}
            }
        }

        // Pass 3: button text match for the submit slot
        if result.submit_index.is_none() {
            for el in &self.elements {
                if !el.visible || (el.tag != "button" && el.role.as_deref() != Some("button")) {
                    continue;
                }
                let text = el.attributes.text.as_deref().unwrap_or("").to_lowercase();
                if ["login", "log in", "sign in", "submit"].iter().any(|k| text.contains(k)) {
                    result.submit_index = Some(el.index);
                    break;
                }
            }
        }

        result
    }

    /// Plain-text rendering of visible element text, for screen-content queries.
    pub fn visible_text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| e.visible)
            .filter_map(|e| e.attributes.text.as_deref())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// SHA-256 hex over the canonical snapshot content: the URL followed by one
/// line per element `tag|role|id|name|type|text-prefix(32)` in index order.
/// Volatile state (scroll, cursor, values) is excluded on purpose.
pub fn compute_content_hash(url: &str, elements: &[DomElement]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    for el in elements {
        hasher.update(b"\n");
        hasher.update(el.hash_line().as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

// =============================================================================
// TESTS
// =============================================================================
