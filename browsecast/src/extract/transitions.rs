//! Transition extraction
//!
//! Detects three pattern families of navigation language, resolves both
//! endpoints against already-extracted screens by fuzzy name match, and
//! rejects transitions whose endpoints cannot be resolved.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::ingest::ContentChunk;
use crate::knowledge::{
    KnowledgeAction, Provenance, Screen, Transition, TransitionCost,
    DEFAULT_TRANSITION_RELIABILITY,
};

use super::{new_id, sentences, similarity, ExtractionContext, SCREEN_RESOLVE_THRESHOLD};

/// "From the dashboard, clicking the settings icon takes you to the settings
/// page."
static CLICK_LEADS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)click(?:ing)?\s+(?:on\s+)?(?:the\s+)?['"]?(.{2,40}?)['"]?\s*(?:button|link|icon|tab)?\s*(?:takes|brings|leads)\s+you\s+to\s+(?:the\s+)?(.{2,40}?)$"#,
    )
    .expect("static regex")
});

/// "Navigate from the inbox to the archive."
static NAVIGATE_FROM_TO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)navigat(?:e|ing)\s+from\s+(?:the\s+)?(.{2,40}?)\s+to\s+(?:the\s+)?(.{2,40}?)$")
        .expect("static regex")
});

/// "After submitting the form, you land on the confirmation page."
static AFTER_ACTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)after\s+(?:submitting|clicking|completing)\s+(?:the\s+)?(.{2,40}?),?\s+you\s+(?:land\s+on|are\s+taken\s+to|see)\s+(?:the\s+)?(.{2,40}?)$",
    )
    .expect("static regex")
});

/// Source-screen context: "From the dashboard, ..."
static FROM_CONTEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^from\s+(?:the\s+)?(.{2,30}?),").expect("static regex"));

static INLINE_CONDITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bif\s+(.{3,60}?)(?:,|$)").expect("static regex"));

static LIST_CONDITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*[-*]\s+(.{3,60})$").expect("static regex"));

/// Rule-based transition extractor. Requires prior-extracted screens (and
/// optionally actions) as context.
#[derive(Default)]
pub struct TransitionExtractor;

impl TransitionExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract transitions, resolving endpoints against `screens`.
    pub fn extract(
        &self,
        chunks: &[ContentChunk],
        screens: &[Screen],
        actions: &[KnowledgeAction],
        ctx: &ExtractionContext,
    ) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for chunk in chunks {
            let conditions_block: Vec<String> = if chunk.text.to_lowercase().contains("conditions:")
            {
                LIST_CONDITION.captures_iter(&chunk.text).map(|c| c[1].trim().to_string()).collect()
            } else {
                Vec::new()
            };

            for sentence in sentences(&chunk.text) {
                let Some(candidate) = match_families(sentence) else { continue };
                let Some(transition) =
                    resolve(candidate, sentence, &conditions_block, chunk, screens, actions, ctx)
                else {
                    continue;
                };
                transitions.push(transition);
            }
        }
        debug!(count = transitions.len(), "transitions extracted");
        transitions
    }
}

struct Candidate {
    from_name: Option<String>,
    to_name: String,
    trigger_name: Option<String>,
}

fn match_families(sentence: &str) -> Option<Candidate> {
    if let Some(cap) = NAVIGATE_FROM_TO.captures(sentence) {
        return Some(Candidate {
            from_name: Some(cap[1].trim().to_string()),
            to_name: cap[2].trim().to_string(),
            trigger_name: None,
        });
    }
    if let Some(cap) = CLICK_LEADS.captures(sentence) {
        let from_name = FROM_CONTEXT.captures(sentence).map(|c| c[1].trim().to_string());
        return Some(Candidate {
            from_name,
            to_name: cap[2].trim().to_string(),
            trigger_name: Some(cap[1].trim().to_string()),
        });
    }
    if let Some(cap) = AFTER_ACTION.captures(sentence) {
        let from_name = FROM_CONTEXT.captures(sentence).map(|c| c[1].trim().to_string());
        return Some(Candidate {
            from_name,
            to_name: cap[2].trim().to_string(),
            trigger_name: Some(cap[1].trim().to_string()),
        });
    }
    None
}

fn resolve_screen<'a>(screens: &'a [Screen], name: &str) -> Option<&'a Screen> {
    let mut best: Option<(&Screen, f64)> = None;
    for screen in screens {
        let score = similarity(name, &screen.name);
        if score >= SCREEN_RESOLVE_THRESHOLD {
            match best {
                Some((_, s)) if s >= score => {}
                _ => best = Some((screen, score)),
            }
        }
    }
    best.map(|(s, _)| s)
}

fn resolve(
    candidate: Candidate,
    sentence: &str,
    conditions_block: &[String],
    chunk: &ContentChunk,
    screens: &[Screen],
    actions: &[KnowledgeAction],
    ctx: &ExtractionContext,
) -> Option<Transition> {
    let to_screen = resolve_screen(screens, &candidate.to_name)?;
    let from_screen = match &candidate.from_name {
        Some(name) => resolve_screen(screens, name)?,
        // Without explicit source context, the chunk's page URL decides.
        None => screens
            .iter()
            .find(|s| chunk.page_url.as_deref().map(|u| s.matches_url(u)).unwrap_or(false))?,
    };
    if from_screen.screen_id == to_screen.screen_id {
        return None;
    }

    let trigger_action_id = candidate.trigger_name.as_ref().and_then(|name| {
        actions
            .iter()
            .find(|a| similarity(name, &a.name) >= 0.6 || a.name.to_lowercase().contains(&name.to_lowercase()))
            .map(|a| a.action_id.clone())
    });

    let mut conditions: Vec<String> = INLINE_CONDITION
        .captures_iter(sentence)
        .map(|cap| cap[1].trim().to_string())
        .collect();
    conditions.extend(conditions_block.iter().cloned());

    Some(Transition {
        transition_id: new_id("transition"),
        knowledge_id: ctx.knowledge_id.clone(),
        from_screen_id: from_screen.screen_id.clone(),
        to_screen_id: to_screen.screen_id.clone(),
        trigger_action_id,
        conditions,
        effects: Vec::new(),
        cost: TransitionCost { estimated_ms: 1000 },
        reliability: DEFAULT_TRANSITION_RELIABILITY,
        delay_intelligence: None,
        provenance: Provenance::new(format!("chunk:{}", chunk.chunk_id), 0.8),
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SourceType;
    use crate::knowledge::{ContentType, StateSignature};

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

    fn chunk(text: &str) -> ContentChunk {
        ContentChunk::new("k1", "src-1", SourceType::Documentation, 0, text)
    }

    fn ctx() -> ExtractionContext {
        ExtractionContext::new("k1")
    }

    #[test]
    fn test_navigate_from_to_family() {
        let screens = [screen("inbox", "Inbox"), screen("archive", "Archive")];
        let chunks = [chunk("Navigate from the inbox to the archive.")];
        let transitions =
            TransitionExtractor::new().extract(&chunks, &screens, &[], &ctx());
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from_screen_id, "inbox");
        assert_eq!(transitions[0].to_screen_id, "archive");
        assert!((transitions[0].reliability - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_click_leads_family_with_context() {
        let screens = [screen("dash", "Dashboard"), screen("settings", "Settings page")];
        let chunks =
            [chunk("From the dashboard, clicking the gear icon takes you to the settings page.")];
        let transitions =
            TransitionExtractor::new().extract(&chunks, &screens, &[], &ctx());
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from_screen_id, "dash");
        assert_eq!(transitions[0].to_screen_id, "settings");
    }

    #[test]
    fn test_after_action_family() {
        let screens = [screen("checkout", "Checkout"), screen("confirm", "Confirmation page")];
        let chunks = [chunk(
            "From the checkout, after submitting the payment form, you land on the confirmation page.",
        )];
        let transitions =
            TransitionExtractor::new().extract(&chunks, &screens, &[], &ctx());
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to_screen_id, "confirm");
    }

    #[test]
    fn test_unresolvable_endpoint_rejected() {
        let screens = [screen("inbox", "Inbox")];
        let chunks = [chunk("Navigate from the inbox to the warp core.")];
        let transitions =
            TransitionExtractor::new().extract(&chunks, &screens, &[], &ctx());
        assert!(transitions.is_empty());
    }

    #[test]
    fn test_trigger_action_linked() {
        let screens = [screen("dash", "Dashboard"), screen("settings", "Settings page")];
        let actions = [KnowledgeAction {
            action_id: "act-gear".into(),
            knowledge_id: "k1".into(),
            name: "Click the gear icon".into(),
            action_type: crate::knowledge::KnowledgeActionType::Click,
            selector: None,
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            idempotent: true,
            reversible_by: None,
            browser_use_action: None,
            confidence_score: 0.9,
            delay_intelligence: None,
            screen_ids: Vec::new(),
            provenance: Provenance::new("test", 0.9),
        }];
        let chunks =
            [chunk("From the dashboard, clicking the gear icon takes you to the settings page.")];
        let transitions =
            TransitionExtractor::new().extract(&chunks, &screens, &actions, &ctx());
        assert_eq!(transitions[0].trigger_action_id.as_deref(), Some("act-gear"));
    }

    #[test]
    fn test_inline_condition_captured() {
        let screens = [screen("inbox", "Inbox"), screen("archive", "Archive")];
        let chunks =
            [chunk("If the message is read, navigate from the inbox to the archive.")];
        let transitions =
            TransitionExtractor::new().extract(&chunks, &screens, &[], &ctx());
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].conditions, vec!["the message is read"]);
    }
}
