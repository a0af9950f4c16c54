//! Screen extraction
//!
//! Identifies screen-describing sections in content chunks and produces
//! [`Screen`] entities: UI-element mentions, state signatures with negative
//! indicators, URL patterns in four families, and keyword-mapped regions.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::debug;

use crate::ingest::{ContentChunk, SourceType};
use crate::knowledge::{
    ContentType, Provenance, RegionType, Screen, ScreenRegion, Selectors, StateSignature,
    UiElement, MAX_INDICATOR_LEN,
};

use super::{clean_entity_name, is_doc_token, new_id, ExtractionContext};

static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#{1,4}\s+(.{2,60})$").expect("static regex"));

static SCREEN_MENTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bthe\s+([A-Z][A-Za-z0-9 /&-]{1,40}?)\s+(page|screen|dashboard|view|panel)\b")
        .expect("static regex")
});

static UI_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\bthe\s+['"]?([A-Za-z][A-Za-z0-9 ]{1,30}?)['"]?\s+(button|link|field|input|menu|icon|checkbox|dropdown|tab)\b"#,
    )
    .expect("static regex")
});

static FULL_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s)"'<>]+"#).expect("static regex"));

static RELATIVE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(?:^|\s)(/[a-z0-9_{}:/-]{3,60})\b").expect("static regex"));

static API_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)\b(?:GET|POST|PUT|PATCH|DELETE)\s+(/[a-z0-9_{}:/-]+)").expect("static regex")
});

static INDICATOR_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:you\s+(?:will\s+)?see|displays|shows)\s+(?:the\s+|an?\s+)?(.{3,60}?)(?:\.|,|$)")
        .expect("static regex")
});

static NEGATIVE_INDICATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)if\s+(?:the\s+)?(.{3,50}?)\s+is\s+(?:present|visible|shown),?\s+you\s+are\s+(?:not\s+)?(?:in|on)\b",
    )
    .expect("static regex")
});

const REGION_KEYWORDS: &[(&str, RegionType)] = &[
    ("header", RegionType::Header),
    ("sidebar", RegionType::Sidebar),
    ("main area", RegionType::Main),
    ("main content", RegionType::Main),
    ("footer", RegionType::Footer),
    ("modal", RegionType::Modal),
    ("navigation", RegionType::Navigation),
    ("nav bar", RegionType::Navigation),
];

/// Rule-based screen extractor.
#[derive(Default)]
pub struct ScreenExtractor;

impl ScreenExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract screens from chunks.
    pub fn extract(&self, chunks: &[ContentChunk], ctx: &ExtractionContext) -> Vec<Screen> {
        let mut screens: Vec<Screen> = Vec::new();
        let mut seen_names: HashSet<String> = HashSet::new();

        for chunk in chunks {
            for name in candidate_names(&chunk.text) {
                let Some(name) = clean_entity_name(&name) else { continue };
                let key = name.to_lowercase();
                if !seen_names.insert(key) {
                    continue;
                }
                if let Some(screen) = build_screen(&name, chunk, ctx) {
                    screens.push(screen);
                }
            }
        }
        debug!(count = screens.len(), "screens extracted");
        screens
    }
}

fn candidate_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    for cap in HEADING.captures_iter(text) {
        names.push(cap[1].to_string());
    }
    for cap in SCREEN_MENTION.captures_iter(text) {
        names.push(format!("{} {}", &cap[1], capitalize(&cap[2])));
    }
    names
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn detect_content_type(chunk: &ContentChunk) -> ContentType {
    match chunk.source_type {
        SourceType::Website => ContentType::WebUi,
        SourceType::Video => ContentType::VideoTranscript,
        SourceType::Documentation => {
            if API_PATH.is_match(&chunk.text) {
                ContentType::ApiDocs
            } else {
                ContentType::Documentation
            }
        }
    }
}

fn build_screen(name: &str, chunk: &ContentChunk, ctx: &ExtractionContext) -> Option<Screen> {
    let content_type = detect_content_type(chunk);
    let url_patterns = extract_url_patterns(&chunk.text, chunk.page_url.as_deref());
    let ui_elements = extract_ui_elements(&chunk.text);
    let regions = extract_regions(&chunk.text);

    let state_signature = if content_type == ContentType::Documentation {
        // Reference material has no runtime state to recognize.
        StateSignature::default()
    } else {
        extract_signature(&chunk.text)
    };

    // A candidate matching one of its own negative indicators is incoherent.
    let observed: Vec<String> = state_signature
        .required
        .iter()
        .chain(&state_signature.optional)
        .cloned()
        .collect();
    if !state_signature.negative.is_empty() && state_signature.score(&observed).is_none() {
        debug!(name, "screen rejected by its own negative indicators");
        return None;
    }

    let mut confidence: f64 = 0.5;
    if !url_patterns.is_empty() {
        confidence += 0.2;
    }
    if !ui_elements.is_empty() {
        confidence += 0.2;
    }
    if !state_signature.is_empty() {
        confidence += 0.1;
    }
    let confidence = confidence.min(1.0);
    if confidence < ctx.min_confidence {
        return None;
    }

    Some(Screen {
        screen_id: new_id("screen"),
        knowledge_id: ctx.knowledge_id.clone(),
        name: name.to_string(),
        content_type,
        is_actionable: content_type == ContentType::WebUi,
        url_patterns,
        state_signature,
        ui_elements,
        regions,
        layout_structure: None,
        action_ids: Vec::new(),
        task_ids: Vec::new(),
        transition_ids: Vec::new(),
        business_function_ids: Vec::new(),
        group_ids: Vec::new(),
        provenance: Provenance::new(format!("chunk:{}", chunk.chunk_id), confidence),
    })
}

/// Four URL-pattern families: full URLs, the chunk's page URL, relative
/// paths, and code-doc method paths. Each candidate is compiled to prove it
/// is a legal regex and dropped when too generic.
fn extract_url_patterns(text: &str, page_url: Option<&str>) -> Vec<String> {
    let mut patterns = Vec::new();

    for m in FULL_URL.find_iter(text) {
        push_pattern(&mut patterns, url_to_pattern(m.as_str()));
    }
    if let Some(url) = page_url {
        push_pattern(&mut patterns, url_to_pattern(url));
    }
    for cap in RELATIVE_PATH.captures_iter(text) {
        push_pattern(&mut patterns, path_to_pattern(&cap[1]));
    }
    for cap in API_PATH.captures_iter(text) {
        push_pattern(&mut patterns, path_to_pattern(&cap[1]));
    }
    patterns
}

fn push_pattern(patterns: &mut Vec<String>, pattern: String) {
    if is_valid_pattern(&pattern) && !patterns.contains(&pattern) {
        patterns.push(pattern);
    }
}

fn url_to_pattern(url: &str) -> String {
    let trimmed = url.trim_end_matches(['.', ',', ';']);
    let escaped = regex::escape(trimmed);
    // Numeric path segments become wildcards so ids generalize.
    let generalized = Regex::new(r"/\d+").expect("static regex").replace_all(&escaped, "/\\d+");
    format!("^{}/?$", generalized)
}

fn path_to_pattern(path: &str) -> String {
    let escaped = regex::escape(path);
    // `{param}` placeholders (escaped to `\{param\}`) match one segment.
    let generalized = Regex::new(r"\\\{[a-z0-9_]+\\\}")
        .expect("static regex")
        .replace_all(&escaped, "[^/]+");
    format!("^https?://[^/]+{}/?$", generalized)
}

fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.len() < 12 {
        return false;
    }
    let Ok(re) = Regex::new(pattern) else { return false };
    // Reject patterns generic enough to match an unrelated URL.
    !re.is_match("https://unrelated.invalid/zzz")
}

fn extract_ui_elements(text: &str) -> Vec<UiElement> {
    let mut elements = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for cap in UI_ELEMENT.captures_iter(text) {
        let Some(name) = clean_entity_name(&cap[1]) else { continue };
        let kind = cap[2].to_lowercase();
        if !seen.insert(format!("{}:{}", name.to_lowercase(), kind)) {
            continue;
        }
        let (css_tag, type_prior): (&str, f64) = match kind.as_str() {
            "button" => ("button", 0.8),
            "link" => ("a", 0.5),
            "field" | "input" => ("input", 0.7),
            "menu" => ("nav", 0.6),
            "icon" => ("svg", 0.4),
            "checkbox" => ("input[type=\"checkbox\"]", 0.6),
            "dropdown" => ("select", 0.7),
            "tab" => ("[role=\"tab\"]", 0.6),
            _ => ("*", 0.4),
        };
        let layout_context = REGION_KEYWORDS
            .iter()
            .find(|(kw, _)| text.to_lowercase().contains(kw))
            .map(|(kw, _)| kw.to_string());
        let importance_bonus = match layout_context.as_deref() {
            Some("header") | Some("main area") | Some("main content") => 0.1,
            _ => 0.0,
        };
        elements.push(UiElement {
            selectors: Selectors {
                css: Some(format!("{}:has-text(\"{}\")", css_tag, name)),
                xpath: None,
                accessibility: Some(name.clone()),
            },
            name,
            position: None,
            layout_context,
            importance_score: (type_prior + importance_bonus).min(1.0),
        });
    }
    elements
}

fn extract_signature(text: &str) -> StateSignature {
    let mut signature = StateSignature::default();

    for cap in INDICATOR_PHRASE.captures_iter(text) {
        let indicator = cap[1].trim().to_string();
        if indicator.chars().count() > MAX_INDICATOR_LEN || is_doc_token(&indicator) {
            continue;
        }
        if signature.required.len() < 3 {
            if !signature.required.contains(&indicator) {
                signature.required.push(indicator);
            }
        } else if !signature.optional.contains(&indicator) {
            signature.optional.push(indicator);
        }
    }

    for cap in NEGATIVE_INDICATOR.captures_iter(text) {
        let indicator = cap[1].trim().to_string();
        if indicator.chars().count() <= MAX_INDICATOR_LEN
            && !signature.negative.contains(&indicator)
        {
            signature.negative.push(indicator);
        }
    }
    signature
}

fn extract_regions(text: &str) -> Vec<ScreenRegion> {
    let lowered = text.to_lowercase();
    let mut regions = Vec::new();
    let mut seen: HashSet<RegionType> = HashSet::new();
    for (keyword, region_type) in REGION_KEYWORDS {
        if lowered.contains(keyword)
            && seen.insert(*region_type)
        {
            regions.push(ScreenRegion { region_type: *region_type, bounds: None });
        }
    }
    regions
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source_type: SourceType, text: &str) -> ContentChunk {
        ContentChunk::new("k1", "src-1", source_type, 0, text)
    }

    fn ctx() -> ExtractionContext {
        ExtractionContext::new("k1")
    }

    #[test]
    fn test_extract_screen_from_website_chunk() {
        let text = "\
# Inbox\n\n\
The Inbox page lists your messages. In the header you will see the unread counter. \
Click the 'Compose' button to write a message. Visit https://mail.example.com/inbox to start.";
        let chunks = [chunk(SourceType::Website, text).page_url("https://mail.example.com/inbox")];
        let screens = ScreenExtractor::new().extract(&chunks, &ctx());

        assert!(!screens.is_empty());
        let inbox = &screens[0];
        assert_eq!(inbox.content_type, ContentType::WebUi);
        assert!(inbox.is_actionable);
        assert!(!inbox.url_patterns.is_empty());
        assert!(inbox.ui_elements.iter().any(|e| e.name == "Compose"));
        assert!(inbox.regions.iter().any(|r| r.region_type == RegionType::Header));
        assert!(inbox.matches_url("https://mail.example.com/inbox"));
    }

    #[test]
    fn test_documentation_screen_has_empty_signature() {
        let text = "# API Guide\n\nYou will see the response body below.";
        let chunks = [chunk(SourceType::Documentation, text)];
        let screens = ScreenExtractor::new().extract(&chunks, &ctx());
        assert!(!screens.is_empty());
        assert!(screens[0].state_signature.is_empty());
        assert_eq!(screens[0].content_type, ContentType::Documentation);
        assert!(!screens[0].is_actionable);
    }

    #[test]
    fn test_api_docs_detection() {
        let text = "# Users API\n\nGET /api/users/{id} returns one user.";
        let chunks = [chunk(SourceType::Documentation, text)];
        let screens = ScreenExtractor::new().extract(&chunks, &ctx());
        assert_eq!(screens[0].content_type, ContentType::ApiDocs);
        assert!(screens[0]
            .url_patterns
            .iter()
            .any(|p| Regex::new(p).unwrap().is_match("https://api.example.com/api/users/42")));
    }

    #[test]
    fn test_negative_indicator_extraction() {
        let text = "\
# Dashboard\n\nYou will see the welcome banner. \
If the login form is present, you are in the logged-out state.";
        let chunks = [chunk(SourceType::Website, text)];
        let screens = ScreenExtractor::new().extract(&chunks, &ctx());
        let dash = &screens[0];
        assert_eq!(dash.state_signature.negative, vec!["login form"]);
    }

    #[test]
    fn test_screen_rejected_by_own_negative_indicator() {
        // The described screen claims to show the login form while also
        // declaring it a negative indicator.
        let text = "\
# Broken\n\nYou will see the login form. \
If the login form is present, you are in the logged-out state.";
        let chunks = [chunk(SourceType::Website, text)];
        let screens = ScreenExtractor::new().extract(&chunks, &ctx());
        assert!(screens.iter().all(|s| s.name != "Broken"));
    }

    #[test]
    fn test_generic_patterns_rejected() {
        assert!(!is_valid_pattern("^.*$"));
        assert!(!is_valid_pattern("^https?$"));
        assert!(is_valid_pattern(r"^https?://[^/]+/settings/?$"));
    }

    #[test]
    fn test_indicator_length_cap() {
        let long = format!("You will see {}", "x".repeat(80));
        let signature = extract_signature(&long);
        assert!(signature.is_within_limits());
    }

    #[test]
    fn test_dedup_by_name() {
        let text = "# Settings\n\nThe Settings page has knobs.\n\n# Settings\n\nRepeated heading.";
        let chunks = [chunk(SourceType::Website, text)];
        let screens = ScreenExtractor::new().extract(&chunks, &ctx());
        let settings: Vec<_> = screens.iter().filter(|s| s.name == "Settings").collect();
        assert_eq!(settings.len(), 1);
    }
}
