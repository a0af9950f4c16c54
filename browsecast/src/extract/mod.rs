//! Knowledge extractors
//!
//! Pure, rule-based functions over [`ContentChunk`]s plus prior-extracted
//! context. Each extractor emits typed entities with provenance metadata;
//! low-confidence entities are rejected at the threshold configured on the
//! workflow.

pub mod actions;
pub mod business;
pub mod screens;
pub mod tasks;
pub mod transitions;

use once_cell::sync::Lazy;
use regex::Regex;

/// Fuzzy threshold for resolving transition endpoints against screens.
pub const SCREEN_RESOLVE_THRESHOLD: f64 = 0.8;

/// Default minimum extraction confidence.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.3;

/// Maximum cleaned entity-name length.
pub const MAX_NAME_LEN: usize = 80;

/// Shared context handed to every extractor.
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    pub knowledge_id: String,
    pub min_confidence: f64,
}

impl ExtractionContext {
    pub fn new(knowledge_id: impl Into<String>) -> Self {
        Self { knowledge_id: knowledge_id.into(), min_confidence: DEFAULT_MIN_CONFIDENCE }
    }

    /// Set the confidence threshold
    pub fn min_confidence(mut self, threshold: f64) -> Self {
        self.min_confidence = threshold;
        self
    }
}

/// Generate a prefixed entity id.
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("static regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Phrases that mark a candidate name as running documentation text rather
/// than an entity name.
static DOC_TEXT_MARKERS: &[&str] = &[
    "click here",
    "for example",
    "see the",
    "note that",
    "as follows",
    "refer to",
    "in this section",
];

/// Tokens too documentation-flavored to serve as state indicators.
pub static DOC_KEYWORDS: &[&str] = &[
    "click", "example", "note", "step", "guide", "tutorial", "chapter", "section", "documentation",
    "see",
];

/// Clean a raw entity name: strip HTML, collapse whitespace, cap the length,
/// and reject documentation-text fragments. Returns `None` when the name is
/// unusable.
pub fn clean_entity_name(raw: &str) -> Option<String> {
    let no_html = HTML_TAG.replace_all(raw, " ");
    let collapsed = WHITESPACE.replace_all(no_html.trim(), " ").to_string();
    if collapsed.len() < 2 {
        return None;
    }
    let lowered = collapsed.to_lowercase();
    if DOC_TEXT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return None;
    }
    // Long sentence-like fragments are prose, not names.
    if collapsed.split_whitespace().count() > 8 {
        return None;
    }
    let capped: String = collapsed.chars().take(MAX_NAME_LEN).collect();
    Some(capped.trim_end_matches(['.', ',', ':']).to_string())
}

/// Whether a token reads like documentation vocabulary.
pub fn is_doc_token(token: &str) -> bool {
    let lowered = token.to_lowercase();
    DOC_KEYWORDS.iter().any(|k| {
        lowered.split_whitespace().any(|w| w == *k)
    })
}

/// Normalized string similarity in [0, 1]: one minus the Levenshtein
/// distance over the longer length, case-insensitive.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let distance = levenshtein(&a, &b);
    let max_len = a.chars().count().max(b.chars().count());
    1.0 - distance as f64 / max_len as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Split text into trimmed sentences. Boundaries are newlines and
/// period-plus-space, so URLs and emails survive intact.
pub fn sentences(text: &str) -> Vec<&str> {
    text.lines()
        .flat_map(|line| line.split(". "))
        .map(|s| s.trim().trim_end_matches('.'))
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_entity_name() {
        assert_eq!(clean_entity_name("  <b>Login</b>  Page "), Some("Login Page".into()));
        assert_eq!(clean_entity_name("Billing:"), Some("Billing".into()));
        assert_eq!(clean_entity_name("x"), None);
        assert_eq!(clean_entity_name("click here to continue"), None);
        assert_eq!(
            clean_entity_name("this is a very long sentence describing what the user should do next"),
            None
        );
    }

    #[test]
    fn test_name_length_cap() {
        let long = "A".repeat(200);
        let cleaned = clean_entity_name(&long).unwrap();
        assert!(cleaned.len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_similarity() {
        assert!((similarity("Login", "login") - 1.0).abs() < 1e-9);
        assert!(similarity("Login Page", "Login Pages") > 0.8);
        assert!(similarity("Dashboard", "Billing") < 0.5);
        assert_eq!(similarity("", "x"), 0.0);
    }

    #[test]
    fn test_doc_token_detection() {
        assert!(is_doc_token("click the button"));
        assert!(is_doc_token("see chapter"));
        assert!(!is_doc_token("inbox list"));
    }

    #[test]
    fn test_sentences() {
        let text = "First sentence. Second one.\nThird";
        assert_eq!(sentences(text), vec!["First sentence", "Second one", "Third"]);
    }
}
