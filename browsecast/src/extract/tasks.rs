//! Task extraction
//!
//! Detects procedural text, produces ordered step sequences, and converts
//! loop language into an explicit [`IteratorSpec`]. Loops never become
//! steps: "for each row, click delete" is one step plus an iterator spec.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::ingest::ContentChunk;
use crate::knowledge::{
    IoSpec, IteratorSpec, IteratorType, Provenance, Task, TaskInput, TaskOutput, TaskStep,
    Volatility,
};

use super::{clean_entity_name, new_id, ExtractionContext};

static NUMBERED_STEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:step\s+)?(\d+)[.):]\s+(.+)$").expect("static regex"));

static TASK_TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^(?:#{1,4}\s+)?(?:how\s+)?to\s+([a-z][^:.\n]{3,60})\s*:?\s*$")
        .expect("static regex")
});

/// The loop-language patterns converted into iterator specs.
static LOOP_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bfor\s+each\s+(.+?)(?:,|:|$)",
        r"(?i)\bfor\s+every\s+(.+?)(?:,|:|$)",
        r"(?i)\brepeat\s+until\s+(.+?)(?:\.|$)",
        r"(?i)\biterate\s+over\s+(.+?)(?:,|:|$)",
        r"(?i)\bloop\s+through\s+(.+?)(?:,|:|$)",
        r"(?i)\beach\s+of\s+the\s+(.+?)(?:,|:|$)",
        r"(?i)\bdelete\s+all\s+(.+?)(?:,|:|\.|$)",
        r"(?i)\buntil\s+there\s+are\s+no\s+(?:more\s+)?(.+?)(?:\.|$)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static TERMINATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\buntil\s+(.+?)(?:\.|$)").expect("static regex"));

static PAGINATION_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(next\s+page|pagination|more\s+pages|page\s+\d+)\b").expect("static regex"));

static INPUT_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:enter|provide|type\s+in|fill\s+in)\s+(?:your\s+|the\s+|an?\s+)?([a-z][a-z0-9 _-]{2,30}?)(?:\.|,|\s+and\b|\s+in\b|\s+into\b|$)")
        .expect("static regex")
});

static OUTPUT_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\byou\s+(?:will\s+)?(?:receive|get|obtain)\s+(?:your\s+|the\s+|an?\s+)?([a-z][a-z0-9 _-]{2,30}?)(?:\.|,|$)")
        .expect("static regex")
});

const STOPWORDS: &[&str] = &["the", "a", "an", "button", "link", "icon", "on", "in"];

/// Rule-based task extractor.
#[derive(Default)]
pub struct TaskExtractor;

impl TaskExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract tasks from chunks.
    pub fn extract(&self, chunks: &[ContentChunk], ctx: &ExtractionContext) -> Vec<Task> {
        let mut tasks = Vec::new();
        for chunk in chunks {
            if let Some(task) = extract_task(chunk, ctx) {
                tasks.push(task);
            }
        }
        debug!(count = tasks.len(), "tasks extracted");
        tasks
    }
}

fn extract_task(chunk: &ContentChunk, ctx: &ExtractionContext) -> Option<Task> {
    let raw_steps: Vec<String> = NUMBERED_STEP
        .captures_iter(&chunk.text)
        .map(|cap| cap[2].trim().to_string())
        .collect();

    // A single loop-sentence is procedural too, even without numbering.
    let loop_only = raw_steps.is_empty()
        && LOOP_PATTERNS.iter().any(|p| p.is_match(&chunk.text));
    let raw_steps = if loop_only {
        super::sentences(&chunk.text)
            .into_iter()
            .filter(|s| LOOP_PATTERNS.iter().any(|p| p.is_match(s)))
            .map(String::from)
            .take(1)
            .collect()
    } else {
        raw_steps
    };
    if raw_steps.is_empty() {
        return None;
    }

    let name = TASK_TITLE
        .captures(&chunk.text)
        .and_then(|cap| clean_entity_name(&cap[1]))
        .map(|n| capitalize_first(&n))
        .unwrap_or_else(|| format!("Task from {}", chunk.source_id));

    let iterator_spec = detect_iterator(&chunk.text);
    let steps: Vec<TaskStep> = raw_steps
        .iter()
        .enumerate()
        .map(|(i, description)| TaskStep {
            order: i + 1,
            description: description.clone(),
            action_id: None,
            screen_precondition: None,
        })
        .collect();

    let confidence = if steps.len() > 1 || iterator_spec.is_looping() { 0.8 } else { 0.5 };
    if confidence < ctx.min_confidence {
        return None;
    }

    Some(Task {
        task_id: new_id("task"),
        knowledge_id: ctx.knowledge_id.clone(),
        name,
        steps,
        io_spec: extract_io(&chunk.text),
        iterator_spec,
        page_url: chunk.page_url.clone(),
        screen_ids: Vec::new(),
        provenance: Provenance::new(format!("chunk:{}", chunk.chunk_id), confidence),
    })
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Convert loop language into an iterator spec; never into steps.
fn detect_iterator(text: &str) -> IteratorSpec {
    for (i, pattern) in LOOP_PATTERNS.iter().enumerate() {
        let Some(cap) = pattern.captures(text) else { continue };
        let subject = cap.get(1).map(|m| m.as_str().trim().to_string());

        let iterator_type = if PAGINATION_HINT.is_match(text) {
            IteratorType::Pagination
        } else {
            IteratorType::CollectionProcessing
        };

        // For "delete all X" the collection is X and the action is the delete
        // itself; for "for each X, <action>" the action is the clause after
        // the comma.
        let (collection_selector, item_action) = if i == 6 {
            (subject.clone(), Some("delete".to_string()))
        } else {
            let action_clause = pattern
                .find(text)
                .and_then(|m| text[m.end()..].split(['.', '\n']).next())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(condense_action);
            (subject.clone(), action_clause)
        };

        let termination_condition = TERMINATION
            .captures(text)
            .map(|cap| cap[1].trim().to_string());

        return IteratorSpec {
            iterator_type,
            collection_selector,
            item_action,
            termination_condition,
            max_iterations: None,
        };
    }
    IteratorSpec::default()
}

/// Condense an action clause to a verb-object slug: "click the delete
/// button" becomes "click-delete".
fn condense_action(clause: &str) -> String {
    let words: Vec<&str> = clause
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty() && !STOPWORDS.contains(&w.to_lowercase().as_str()))
        .take(2)
        .collect();
    words.join("-").to_lowercase()
}

fn extract_io(text: &str) -> IoSpec {
    let mut inputs = Vec::new();
    for cap in INPUT_PHRASE.captures_iter(text) {
        let name = cap[1].trim().to_lowercase();
        if inputs.iter().any(|i: &TaskInput| i.name == name) {
            continue;
        }
        inputs.push(TaskInput {
            volatility: volatility_for(&name),
            value_type: None,
            name,
        });
    }
    let outputs = OUTPUT_PHRASE
        .captures_iter(text)
        .map(|cap| TaskOutput { name: cap[1].trim().to_lowercase(), value_type: None })
        .collect();
    let resolution_order = inputs.iter().map(|i| i.name.clone()).collect();
    IoSpec { inputs, outputs, resolution_order }
}

/// Keyword-based volatility assignment.
fn volatility_for(name: &str) -> Volatility {
    const HIGH: &[&str] = &["token", "password", "otp", "secret", "code"];
    const MEDIUM: &[&str] = &["session", "cart", "filter", "search"];
    if HIGH.iter().any(|k| name.contains(k)) {
        Volatility::High
    } else if MEDIUM.iter().any(|k| name.contains(k)) {
        Volatility::Medium
    } else {
        Volatility::Low
    }
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

    #[test]
    fn test_numbered_steps_extraction() {
        let text = "\
To reset your password:\n\
1. Open the settings page\n\
2. Click the security tab\n\
3. Enter your new password and save";
        let tasks = TaskExtractor::new().extract(&[chunk(text)], &ctx());
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.name, "Reset your password");
        assert_eq!(task.steps.len(), 3);
        assert_eq!(task.steps[0].order, 1);
        assert!(!task.iterator_spec.is_looping());
    }

    #[test]
    fn test_collection_loop_becomes_iterator_spec() {
        // Literal scenario: one step plus an iterator spec, never a loop in
        // the step list.
        let text = "For each row in the table, click the delete button.";
        let tasks = TaskExtractor::new().extract(&[chunk(text)], &ctx());
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.steps.len(), 1);
        assert_eq!(task.iterator_spec.iterator_type, IteratorType::CollectionProcessing);
        assert_eq!(task.iterator_spec.collection_selector.as_deref(), Some("row in the table"));
        assert_eq!(task.iterator_spec.item_action.as_deref(), Some("click-delete"));
    }

    #[test]
    fn test_pagination_loop() {
        let text = "\
To export every invoice:\n\
1. Open the invoices list\n\
2. Download each of the visible invoices, then open the next page\n\
Repeat until there are no more pages.";
        let tasks = TaskExtractor::new().extract(&[chunk(text)], &ctx());
        let task = &tasks[0];
        assert_eq!(task.iterator_spec.iterator_type, IteratorType::Pagination);
        assert!(task.iterator_spec.termination_condition.is_some());
    }

    #[test]
    fn test_delete_all_pattern() {
        let text = "Delete all stale sessions from the list.";
        let tasks = TaskExtractor::new().extract(&[chunk(text)], &ctx());
        let spec = &tasks[0].iterator_spec;
        assert_eq!(spec.iterator_type, IteratorType::CollectionProcessing);
        assert_eq!(spec.item_action.as_deref(), Some("delete"));
    }

    #[test]
    fn test_io_extraction_with_volatility() {
        let text = "\
To sign in:\n\
1. Enter your email in the first field\n\
2. Enter your password\n\
3. Click submit, then you will receive a session token";
        let tasks = TaskExtractor::new().extract(&[chunk(text)], &ctx());
        let io = &tasks[0].io_spec;

        let email = io.inputs.iter().find(|i| i.name == "email").unwrap();
        assert_eq!(email.volatility, Volatility::Low);
        let password = io.inputs.iter().find(|i| i.name == "password").unwrap();
        assert_eq!(password.volatility, Volatility::High);
        assert_eq!(io.resolution_order, vec!["email", "password"]);
        assert!(!io.outputs.is_empty());
    }

    #[test]
    fn test_non_procedural_text_produces_nothing() {
        let text = "The dashboard shows usage charts and a welcome banner.";
        let tasks = TaskExtractor::new().extract(&[chunk(text)], &ctx());
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_backward_reference_caught_by_validator() {
        let text = "\
To retry a failed sync:\n\
1. Open the sync panel\n\
2. Click retry\n\
3. If it fails again, go back to step 1";
        let tasks = TaskExtractor::new().extract(&[chunk(text)], &ctx());
        let mut slice = crate::knowledge::KnowledgeSlice::new("k1");
        slice.tasks = tasks;
        let issues = crate::knowledge::validate::validate_slice(&slice);
        assert!(issues.iter().any(|i| i.code == "backward_step_reference"));
    }
}
