//! Action extraction
//!
//! Detects the six canonical interaction types in text, generates CSS
//! selectors for described targets, and translates each action into a
//! driver-ready runtime action. The confidence score reflects how complete
//! that translation is.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::debug;

use crate::ingest::ContentChunk;
use crate::knowledge::{KnowledgeAction, KnowledgeActionType, Provenance};

use super::{clean_entity_name, new_id, sentences, ExtractionContext};

static CLICK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(click|press|tap)\b").expect("static regex"));
static TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(type|enter|fill\s+in)\b").expect("static regex"));
static NAVIGATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(navigate\s+to|go\s+to|open|visit)\b").expect("static regex"));
static SELECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(select|choose|pick)\b").expect("static regex"));
static SCROLL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bscroll\b").expect("static regex"));
static WAIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bwait\b").expect("static regex"));

static TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:the\s+)?['"]?([A-Za-z][A-Za-z0-9 ]{1,30}?)['"]?\s+(button|link|field|input|menu|option|tab|icon|dropdown)\b"#,
    )
    .expect("static regex")
});

static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s)"'<>]+"#).expect("static regex"));

static TYPED_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:type|enter)\s+['"]([^'"]{1,60})['"]"#).expect("static regex")
});

static NON_IDEMPOTENT_VERB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(submit|create|delete|remove|add|purchase|send)\b").expect("static regex")
});

/// Rule-based action extractor.
#[derive(Default)]
pub struct ActionExtractor;

impl ActionExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract actions from chunks.
    pub fn extract(&self, chunks: &[ContentChunk], ctx: &ExtractionContext) -> Vec<KnowledgeAction> {
        let mut actions = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        for chunk in chunks {
            for sentence in sentences(&chunk.text) {
                let Some(action) = extract_action(sentence, chunk, ctx) else { continue };
                if seen.insert(action.name.to_lowercase()) {
                    actions.push(action);
                }
            }
        }
        debug!(count = actions.len(), "actions extracted");
        actions
    }
}

fn detect_type(sentence: &str) -> Option<KnowledgeActionType> {
    // Order matters: "enter" is typing even when the sentence also says
    // "open" later.
    if CLICK.is_match(sentence) {
        Some(KnowledgeActionType::Click)
    } else if TYPE.is_match(sentence) {
        Some(KnowledgeActionType::Type)
    } else if SELECT.is_match(sentence) {
        Some(KnowledgeActionType::SelectOption)
    } else if NAVIGATE.is_match(sentence) {
        Some(KnowledgeActionType::Navigate)
    } else if SCROLL.is_match(sentence) {
        Some(KnowledgeActionType::Scroll)
    } else if WAIT.is_match(sentence) {
        Some(KnowledgeActionType::Wait)
    } else {
        None
    }
}

fn selector_for(target_name: &str, target_kind: &str) -> String {
    let tag = match target_kind {
        "button" => "button",
        "link" => "a",
        "field" | "input" => "input",
        "menu" => "nav",
        "option" | "dropdown" => "select",
        "tab" => "[role=\"tab\"]",
        "icon" => "svg",
        _ => "*",
    };
    format!("{}:has-text(\"{}\")", tag, target_name)
}

/// Translate to a runtime action fragment. Returns the JSON plus whether the
/// translation is complete (all required params present).
fn translate(
    action_type: KnowledgeActionType,
    sentence: &str,
) -> (Option<serde_json::Value>, bool) {
    match action_type {
        KnowledgeActionType::Click => (
            Some(json!({"action_type": "click", "params": {}})),
            true,
        ),
        KnowledgeActionType::Type => {
            let text = TYPED_TEXT.captures(sentence).map(|c| c[1].to_string());
            let complete = text.is_some();
            (
                Some(json!({"action_type": "type", "params": {"text": text.unwrap_or_default()}})),
                complete,
            )
        }
        KnowledgeActionType::Navigate => {
            let url = URL.find(sentence).map(|m| m.as_str().trim_end_matches(['.', ',']));
            match url {
                Some(url) => (
                    Some(json!({"action_type": "navigate", "params": {"url": url, "new_tab": false}})),
                    true,
                ),
                None => (None, false),
            }
        }
        KnowledgeActionType::SelectOption => (
            Some(json!({"action_type": "select_dropdown", "params": {"index": 0}})),
            false,
        ),
        KnowledgeActionType::Scroll => (
            Some(json!({"action_type": "scroll", "params": {"direction": "down", "amount": 600.0}})),
            true,
        ),
        KnowledgeActionType::Wait => (
            Some(json!({"action_type": "wait", "params": {"seconds": 1.0}})),
            true,
        ),
    }
}

fn extract_action(
    sentence: &str,
    chunk: &ContentChunk,
    ctx: &ExtractionContext,
) -> Option<KnowledgeAction> {
    let action_type = detect_type(sentence)?;
    let name = clean_entity_name(&sentence.chars().take(60).collect::<String>())
        .unwrap_or_else(|| format!("{:?} action", action_type));

    let target = TARGET.captures(sentence);
    let selector = target.as_ref().and_then(|cap| {
        clean_entity_name(&cap[1]).map(|name| selector_for(&name, &cap[2].to_lowercase()))
    });

    let (browser_use_action, complete) = translate(action_type, sentence);

    // Confidence tracks translation completeness.
    let confidence_score = if complete {
        0.9
    } else if browser_use_action.is_some() {
        0.6
    } else {
        0.3
    };
    if confidence_score < ctx.min_confidence {
        return None;
    }

    let non_idempotent_verb = NON_IDEMPOTENT_VERB.is_match(sentence);
    let idempotent = match action_type {
        KnowledgeActionType::Type
        | KnowledgeActionType::Navigate
        | KnowledgeActionType::Scroll
        | KnowledgeActionType::Wait => true,
        KnowledgeActionType::Click | KnowledgeActionType::SelectOption => !non_idempotent_verb,
    };

    let lowered = sentence.to_lowercase();
    let reversible_by = if lowered.contains("open") {
        Some("close".to_string())
    } else if lowered.contains("expand") {
        Some("collapse".to_string())
    } else {
        None
    };

    Some(KnowledgeAction {
        action_id: new_id("action"),
        knowledge_id: ctx.knowledge_id.clone(),
        name,
        action_type,
        selector,
        preconditions: Vec::new(),
        postconditions: Vec::new(),
        idempotent,
        reversible_by,
        browser_use_action,
        confidence_score,
        delay_intelligence: None,
        screen_ids: Vec::new(),
        provenance: Provenance::new(
            format!("chunk:{}:{:?}", chunk.chunk_id, chunk.source_type),
            confidence_score,
        ),
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SourceType;

    fn chunk(text: &str) -> ContentChunk {
        ContentChunk::new("k1", "src-1", SourceType::Documentation, 0, text)
    }

    fn ctx() -> ExtractionContext {
        ExtractionContext::new("k1")
    }

    fn extract(text: &str) -> Vec<KnowledgeAction> {
        ActionExtractor::new().extract(&[chunk(text)], &ctx())
    }

    #[test]
    fn test_click_action_with_selector() {
        let actions = extract("Click the Save button to persist changes");
        assert_eq!(actions.len(), 1);
        let action = &actions[0];
        assert_eq!(action.action_type, KnowledgeActionType::Click);
        assert_eq!(action.selector.as_deref(), Some("button:has-text(\"Save\")"));
        assert!(action.idempotent);
        let translated = action.browser_use_action.as_ref().unwrap();
        assert_eq!(translated["action_type"], "click");
    }

    #[test]
    fn test_submit_click_is_non_idempotent() {
        let actions = extract("Click the Submit button to create the record");
        assert!(!actions[0].idempotent);
    }

    #[test]
    fn test_navigate_translation_needs_url() {
        let with_url = extract("Navigate to https://example.com/settings for options");
        assert_eq!(with_url[0].action_type, KnowledgeActionType::Navigate);
        assert!((with_url[0].confidence_score - 0.9).abs() < 1e-9);
        assert_eq!(
            with_url[0].browser_use_action.as_ref().unwrap()["params"]["url"],
            "https://example.com/settings"
        );

        let without_url = extract("Navigate to the billing area");
        // No URL: translation fails, confidence floor applies.
        assert!(without_url.is_empty() || without_url[0].confidence_score <= 0.3);
    }

    #[test]
    fn test_type_translation_extracts_text() {
        let actions = extract("Type 'alice@example.com' into the email field");
        let action = &actions[0];
        assert_eq!(action.action_type, KnowledgeActionType::Type);
        assert_eq!(
            action.browser_use_action.as_ref().unwrap()["params"]["text"],
            "alice@example.com"
        );
        assert!(action.idempotent);
    }

    #[test]
    fn test_reversible_by_heuristic() {
        let actions = extract("Click the menu icon to open the navigation");
        assert_eq!(actions[0].reversible_by.as_deref(), Some("close"));
    }

    #[test]
    fn test_scroll_and_wait() {
        let actions = extract("Scroll down to the bottom. Wait for the spinner to finish");
        let types: Vec<KnowledgeActionType> = actions.iter().map(|a| a.action_type).collect();
        assert!(types.contains(&KnowledgeActionType::Scroll));
        assert!(types.contains(&KnowledgeActionType::Wait));
    }

    #[test]
    fn test_non_action_text_ignored() {
        let actions = extract("The dashboard is green and friendly");
        assert!(actions.is_empty());
    }
}
