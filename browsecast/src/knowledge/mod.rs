//! Knowledge System Module
//!
//! The typed knowledge graph extracted from docs, site crawls, and video:
//! - `Screen` / `KnowledgeAction` / `Task` / `Transition` - Core entities
//! - `ScreenGroup` - Functional partitions with recovery edges
//! - `BusinessFunction` / `UserFlow` / `WorkflowEntity` / `BusinessFeature` -
//!   Higher-level entities with bidirectional references
//!
//! Entities reference each other by id only; adjacency lives in the
//! separately-indexed [`graph`] module rather than pointer cycles. Every
//! entity carries a `knowledge_id` to support bulk replace-on-resync.

pub mod graph;
pub mod linker;
pub mod store;
pub mod validate;

use serde::{Deserialize, Serialize};

use crate::delay::DelayStats;
use crate::dom::BBox;

/// Indicators longer than this are rejected at extraction and validation.
pub const MAX_INDICATOR_LEN: usize = 50;

/// Collection names in the document store, uniformly prefixed.
pub mod collections {
    pub const SCREENS: &str = "kb_screens";
    pub const ACTIONS: &str = "kb_actions";
    pub const TASKS: &str = "kb_tasks";
    pub const TRANSITIONS: &str = "kb_transitions";
    pub const SCREEN_GROUPS: &str = "kb_screen_groups";
    pub const BUSINESS_FUNCTIONS: &str = "kb_business_functions";
    pub const USER_FLOWS: &str = "kb_user_flows";
    pub const WORKFLOWS: &str = "kb_workflows";
    pub const FEATURES: &str = "kb_features";
    pub const CHUNKS: &str = "kb_chunks";

    /// Every entity collection subject to replace-by-id semantics.
    pub const ALL: &[&str] = &[
        SCREENS,
        ACTIONS,
        TASKS,
        TRANSITIONS,
        SCREEN_GROUPS,
        BUSINESS_FUNCTIONS,
        USER_FLOWS,
        WORKFLOWS,
        FEATURES,
        CHUNKS,
    ];
}

// =============================================================================
// PROVENANCE
// =============================================================================

/// Extraction provenance carried by every extracted entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Chunk or source the entity came from
    pub extraction_source: String,
    /// Extractor confidence in [0, 1]
    pub extraction_confidence: f64,
    /// Extraction time (RFC 3339)
    #[serde(default)]
    pub extracted_at: String,
    /// Free-form notes from capture analysis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_analysis: Option<String>,
}

impl Provenance {
    pub fn new(source: impl Into<String>, confidence: f64) -> Self {
        Self {
            extraction_source: source.into(),
            extraction_confidence: confidence,
            extracted_at: chrono::Utc::now().to_rfc3339(),
            capture_analysis: None,
        }
    }
}

// =============================================================================
// SCREEN
// =============================================================================

/// Content family a screen belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    WebUi,
    Documentation,
    VideoTranscript,
    ApiDocs,
}

/// Observable indicators identifying a screen. Each indicator is a semantic
/// token of at most [`MAX_INDICATOR_LEN`] chars. `negative` indicators rule a
/// candidate out when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSignature {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclusion: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub negative: Vec<String>,
}

impl StateSignature {
    /// Whether every indicator respects the length cap.
    pub fn is_within_limits(&self) -> bool {
        self.all_indicators().all(|i| i.chars().count() <= MAX_INDICATOR_LEN)
    }

    /// Whether the signature carries no indicators at all.
    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
            && self.optional.is_empty()
            && self.exclusion.is_empty()
            && self.negative.is_empty()
    }

    fn all_indicators(&self) -> impl Iterator<Item = &String> {
        self.required
            .iter()
            .chain(&self.optional)
            .chain(&self.exclusion)
            .chain(&self.negative)
    }

    /// Score a set of observed tokens against this signature. Returns `None`
    /// when a negative or exclusion indicator matches (candidate rejected),
    /// otherwise a match score: required hits weighted over optional ones.
    pub fn score(&self, observed: &[String]) -> Option<f64> {
        let contains = |indicator: &String| {
            observed.iter().any(|t| t.to_lowercase().contains(&indicator.to_lowercase()))
        };
        if self.negative.iter().any(contains) || self.exclusion.iter().any(contains) {
            return None;
        }
        if self.required.is_empty() && self.optional.is_empty() {
            return Some(0.0);
        }
        let required_hits = self.required.iter().filter(|i| contains(i)).count();
        if required_hits < self.required.len() {
            return Some(0.0);
        }
        let optional_hits = self.optional.iter().filter(|i| contains(i)).count();
        let optional_share = if self.optional.is_empty() {
            0.0
        } else {
            optional_hits as f64 / self.optional.len() as f64
        };
        Some(1.0 + optional_share)
    }
}

/// Selector strategies for a UI element mention.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selectors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub css: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessibility: Option<String>,
}

/// A UI element mentioned for a screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiElement {
    pub name: String,
    pub selectors: Selectors,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<BBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_context: Option<String>,
    /// Importance in [0, 1] from layout context, size, and element-type prior
    pub importance_score: f64,
}

/// Typed screen region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionType {
    Header,
    Sidebar,
    Main,
    Footer,
    Modal,
    Navigation,
}

/// One region of a screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenRegion {
    pub region_type: RegionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<BBox>,
}

/// A screen in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screen {
    pub screen_id: String,
    pub knowledge_id: String,
    pub name: String,
    pub content_type: ContentType,
    pub is_actionable: bool,
    /// URL patterns as validated regexes
    #[serde(default)]
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub state_signature: StateSignature,
    #[serde(default)]
    pub ui_elements: Vec<UiElement>,
    #[serde(default)]
    pub regions: Vec<ScreenRegion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_structure: Option<String>,
    // Cross-references, maintained by the linker
    #[serde(default)]
    pub action_ids: Vec<String>,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub transition_ids: Vec<String>,
    #[serde(default)]
    pub business_function_ids: Vec<String>,
    #[serde(default)]
    pub group_ids: Vec<String>,
    pub provenance: Provenance,
}

impl Screen {
    /// Whether a URL matches any of this screen's url patterns.
    pub fn matches_url(&self, url: &str) -> bool {
        self.url_patterns.iter().any(|p| {
            regex::Regex::new(p).map(|re| re.is_match(url)).unwrap_or(false)
        })
    }
}

// =============================================================================
// KNOWLEDGE ACTION
// =============================================================================

/// Canonical knowledge-tier action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeActionType {
    Click,
    Type,
    Navigate,
    SelectOption,
    Scroll,
    Wait,
}

/// A learned interaction template, translatable to a runtime action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeAction {
    pub action_id: String,
    pub knowledge_id: String,
    pub name: String,
    pub action_type: KnowledgeActionType,
    /// CSS selector for the described target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub postconditions: Vec<String>,
    pub idempotent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversible_by: Option<String>,
    /// Driver-ready translation: a runtime action envelope fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_use_action: Option<serde_json::Value>,
    /// Confidence from the translation to the runtime tag
    pub confidence_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_intelligence: Option<DelayStats>,
    #[serde(default)]
    pub screen_ids: Vec<String>,
    pub provenance: Provenance,
}

// =============================================================================
// TASK
// =============================================================================

/// How often a task input's value changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Volatility {
    Low,
    Medium,
    High,
}

/// A typed task input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    pub volatility: Volatility,
}

/// A typed task output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

/// Input/output contract of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IoSpec {
    #[serde(default)]
    pub inputs: Vec<TaskInput>,
    #[serde(default)]
    pub outputs: Vec<TaskOutput>,
    /// Variable resolution order by input name
    #[serde(default)]
    pub resolution_order: Vec<String>,
}

/// Loop representation inside a task. Loops never appear in the step list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IteratorType {
    CollectionProcessing,
    Pagination,
    #[default]
    None,
}

/// Explicit iterator specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IteratorSpec {
    #[serde(rename = "type")]
    pub iterator_type: IteratorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

impl IteratorSpec {
    /// Whether the task loops at all
    pub fn is_looping(&self) -> bool {
        self.iterator_type != IteratorType::None
    }
}

/// One ordered step of a task. Steps are strictly linear; backward
/// references are a validation error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub order: usize,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_precondition: Option<String>,
}

/// A procedural task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub knowledge_id: String,
    pub name: String,
    pub steps: Vec<TaskStep>,
    #[serde(default)]
    pub io_spec: IoSpec,
    #[serde(default)]
    pub iterator_spec: IteratorSpec,
    /// Source page URL, used by the linker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default)]
    pub screen_ids: Vec<String>,
    pub provenance: Provenance,
}

// =============================================================================
// TRANSITION
// =============================================================================

/// Cost estimate of traversing a transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionCost {
    pub estimated_ms: u64,
}

/// A navigation edge between two screens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub transition_id: String,
    pub knowledge_id: String,
    pub from_screen_id: String,
    pub to_screen_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_action_id: Option<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub effects: Vec<String>,
    #[serde(default)]
    pub cost: TransitionCost,
    /// Reliability in [0, 1], default 0.95
    pub reliability: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_intelligence: Option<DelayStats>,
    pub provenance: Provenance,
}

/// Default reliability for extracted transitions.
pub const DEFAULT_TRANSITION_RELIABILITY: f64 = 0.95;

// =============================================================================
// SCREEN GROUP
// =============================================================================

/// Priority-ordered fallback to a known-safe screen. Lower priority is safer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEdge {
    pub screen_id: String,
    pub priority: u32,
    pub reliability: f64,
}

/// A logical partition of screens by functional area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenGroup {
    pub group_id: String,
    pub knowledge_id: String,
    pub name: String,
    #[serde(default)]
    pub screen_ids: Vec<String>,
    /// Sorted ascending by priority
    #[serde(default)]
    pub recovery_edges: Vec<RecoveryEdge>,
}

impl ScreenGroup {
    /// Recovery edges sorted by ascending priority (safest first).
    pub fn sorted_recovery_edges(&self) -> Vec<RecoveryEdge> {
        let mut edges = self.recovery_edges.clone();
        edges.sort_by_key(|e| e.priority);
        edges
    }
}

// =============================================================================
// HIGHER-LEVEL ENTITIES
// =============================================================================

/// A business capability mentioned across sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessFunction {
    pub function_id: String,
    pub knowledge_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Screen names as mentioned in source text, resolved by the linker
    #[serde(default)]
    pub screens_mentioned: Vec<String>,
    #[serde(default)]
    pub screen_ids: Vec<String>,
    #[serde(default)]
    pub task_ids: Vec<String>,
    pub provenance: Provenance,
}

/// A user-level flow through the product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFlow {
    pub flow_id: String,
    pub knowledge_id: String,
    pub name: String,
    #[serde(default)]
    pub step_descriptions: Vec<String>,
    #[serde(default)]
    pub screen_ids: Vec<String>,
    #[serde(default)]
    pub action_ids: Vec<String>,
    pub provenance: Provenance,
}

/// A multi-step workflow entity referencing screens, tasks, and actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEntity {
    pub workflow_id: String,
    pub knowledge_id: String,
    pub name: String,
    /// Raw step references as written in the source
    #[serde(default)]
    pub step_refs: Vec<String>,
    #[serde(default)]
    pub screen_ids: Vec<String>,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub action_ids: Vec<String>,
    pub provenance: Provenance,
}

/// A product feature grouping business functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessFeature {
    pub feature_id: String,
    pub knowledge_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub function_ids: Vec<String>,
    pub provenance: Provenance,
}

// =============================================================================
// SLICE
// =============================================================================

/// The full entity set for one knowledge id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSlice {
    pub knowledge_id: String,
    #[serde(default)]
    pub screens: Vec<Screen>,
    #[serde(default)]
    pub actions: Vec<KnowledgeAction>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub groups: Vec<ScreenGroup>,
    #[serde(default)]
    pub functions: Vec<BusinessFunction>,
    #[serde(default)]
    pub flows: Vec<UserFlow>,
    #[serde(default)]
    pub workflows: Vec<WorkflowEntity>,
    #[serde(default)]
    pub features: Vec<BusinessFeature>,
}

impl KnowledgeSlice {
    /// Create an empty slice for a knowledge id
    pub fn new(knowledge_id: impl Into<String>) -> Self {
        Self { knowledge_id: knowledge_id.into(), ..Default::default() }
    }

    /// Total entity count across all types
    pub fn entity_count(&self) -> usize {
        self.screens.len()
            + self.actions.len()
            + self.tasks.len()
            + self.transitions.len()
            + self.groups.len()
            + self.functions.len()
            + self.flows.len()
            + self.workflows.len()
            + self.features.len()
    }

    /// Find a screen by id
    pub fn screen(&self, screen_id: &str) -> Option<&Screen> {
        self.screens.iter().find(|s| s.screen_id == screen_id)
    }

    /// Resolve a screen id by fuzzy name similarity at a threshold.
    pub fn resolve_screen_by_name(&self, name: &str, threshold: f64) -> Option<&Screen> {
        let mut best: Option<(&Screen, f64)> = None;
        for screen in &self.screens {
            let score = crate::extract::similarity(name, &screen.name);
            if score >= threshold {
                match best {
                    Some((_, s)) if s >= score => {}
                    _ => best = Some((screen, score)),
                }
            }
        }
        best.map(|(s, _)| s)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn screen(id: &str, name: &str) -> Screen {
        Screen {
            screen_id: id.into(),
            knowledge_id: "k1".into(),
            name: name.into(),
            content_type: ContentType::WebUi,
            is_actionable: true,
            url_patterns: Vec::new(),
            state_signature: StateSignature::default(),
            ui_elements: Vec::new(),
            regions: Vec::new(),
            layout_structure: None,
            action_ids: Vec::new(),
            task_ids: Vec::new(),
            transition_ids: Vec::new(),
            business_function_ids: Vec::new(),
            group_ids: Vec::new(),
            provenance: Provenance::new("test", 0.9),
        }
    }

    #[test]
    fn test_signature_length_limits() {
        let ok = StateSignature {
            required: vec!["dashboard header".into()],
            ..Default::default()
        };
        assert!(ok.is_within_limits());

        let too_long = StateSignature {
            required: vec!["x".repeat(51)],
            ..Default::default()
        };
        assert!(!too_long.is_within_limits());
    }

    #[test]
    fn test_signature_negative_rejects() {
        let sig = StateSignature {
            required: vec!["inbox".into()],
            negative: vec!["login form".into()],
            ..Default::default()
        };
        let observed = vec!["inbox".to_string(), "login form visible".to_string()];
        assert_eq!(sig.score(&observed), None);

        let observed = vec!["inbox list".to_string()];
        assert!(sig.score(&observed).unwrap() >= 1.0);
    }

    #[test]
    fn test_signature_required_all_or_nothing() {
        let sig = StateSignature {
            required: vec!["inbox".into(), "compose".into()],
            ..Default::default()
        };
        assert_eq!(sig.score(&vec!["inbox".to_string()]), Some(0.0));
        assert_eq!(
            sig.score(&vec!["inbox".to_string(), "compose button".to_string()]),
            Some(1.0)
        );
    }

    #[test]
    fn test_screen_url_match() {
        let mut s = screen("s1", "Login");
        s.url_patterns = vec![r"https://example\.com/login/?".into()];
        assert!(s.matches_url("https://example.com/login"));
        assert!(!s.matches_url("https://example.com/settings"));
    }

    #[test]
    fn test_recovery_edges_sorted() {
        let group = ScreenGroup {
            group_id: "g1".into(),
            knowledge_id: "k1".into(),
            name: "mail".into(),
            screen_ids: vec!["s1".into()],
            recovery_edges: vec![
                RecoveryEdge { screen_id: "back".into(), priority: 3, reliability: 0.8 },
                RecoveryEdge { screen_id: "dash".into(), priority: 1, reliability: 1.0 },
                RecoveryEdge { screen_id: "settings".into(), priority: 2, reliability: 0.9 },
            ],
        };
        let sorted = group.sorted_recovery_edges();
        assert_eq!(sorted[0].screen_id, "dash");
        assert_eq!(sorted[2].screen_id, "back");
    }

    #[test]
    fn test_iterator_spec_wire_shape() {
        let spec = IteratorSpec {
            iterator_type: IteratorType::CollectionProcessing,
            collection_selector: Some("row in the table".into()),
            item_action: Some("click-delete".into()),
            termination_condition: Some("no rows remain".into()),
            max_iterations: Some(100),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "collection_processing");
        assert_eq!(json["collection_selector"], "row in the table");
    }

    #[test]
    fn test_slice_resolve_screen_by_name() {
        let mut slice = KnowledgeSlice::new("k1");
        slice.screens.push(screen("s1", "Login Page"));
        slice.screens.push(screen("s2", "Settings"));

        let hit = slice.resolve_screen_by_name("login page", 0.8).unwrap();
        assert_eq!(hit.screen_id, "s1");
        assert!(slice.resolve_screen_by_name("billing", 0.8).is_none());
    }

    #[test]
    fn test_slice_entity_count() {
        let mut slice = KnowledgeSlice::new("k1");
        slice.screens.push(screen("s1", "A"));
        slice.screens.push(screen("s2", "B"));
        assert_eq!(slice.entity_count(), 2);
    }
}
