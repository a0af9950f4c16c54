//! Knowledge invariant validators
//!
//! Semantic checks run as the workflow's validate phase:
//! - State-signature limits (length cap, documentation screens stay empty)
//! - Linear task steps (no backward references, loops only in iterator_spec)
//! - Task-step cycle detection by DFS (up to 5 cycles reported)
//! - Reference resolution within one knowledge id
//! - Group coverage and recovery-edge presence

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{ContentType, KnowledgeSlice, Task};

/// How severe a validation finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

impl ValidationIssue {
    fn error(code: &str, message: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code: code.to_string(),
            message: message.into(),
            entity_id: Some(entity_id.into()),
        }
    }

    fn warning(code: &str, message: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code: code.to_string(),
            message: message.into(),
            entity_id: Some(entity_id.into()),
        }
    }
}

static BACKWARD_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:go\s+)?(?:return\s+)?back\s+to\s+step\s+(\d+)").expect("static regex")
});

static STEP_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)step\s+(\d+)").expect("static regex"));

static LOOP_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(for\s+each|for\s+every|repeat\s+until|iterate\s+over|loop\s+through|each\s+of\s+the|delete\s+all|until\s+there\s+are\s+no)\b")
        .expect("static regex")
});

/// A cycle found in a task's step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCycle {
    /// One-based step number the cycle starts at
    pub start_step: usize,
    /// Step numbers along the cycle
    pub path: Vec<usize>,
}

/// Backward references in a task's steps: pairs of (step number, referenced
/// earlier step).
pub fn backward_references(task: &Task) -> Vec<(usize, usize)> {
    let mut refs = Vec::new();
    for (pos, step) in task.steps.iter().enumerate() {
        let current = pos + 1;
        for cap in BACKWARD_REF.captures_iter(&step.description) {
            if let Some(target) = cap.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) {
                if target < current {
                    refs.push((current, target));
                }
            }
        }
    }
    refs
}

/// Detect cycles in a task's step graph by DFS. Edges are the linear
/// progression plus any explicit "step N" references; at most `max_cycles`
/// are reported, each with its starting step.
pub fn find_step_cycles(task: &Task, max_cycles: usize) -> Vec<StepCycle> {
    let n = task.steps.len();
    if n == 0 {
        return Vec::new();
    }

    // Adjacency over one-based step numbers.
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n + 1];
    for (pos, step) in task.steps.iter().enumerate() {
        let current = pos + 1;
        if current < n {
            edges[current].push(current + 1);
        }
        for cap in STEP_REF.captures_iter(&step.description) {
            if let Some(target) = cap.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) {
                if target >= 1 && target <= n && target != current + 1 {
                    edges[current].push(target);
                }
            }
        }
    }

    let mut cycles = Vec::new();
    let mut state = vec![0u8; n + 1]; // 0 unvisited, 1 on stack, 2 done
    let mut stack: Vec<usize> = Vec::new();

    fn dfs(
        node: usize,
        edges: &[Vec<usize>],
        state: &mut [u8],
        stack: &mut Vec<usize>,
        cycles: &mut Vec<StepCycle>,
        max_cycles: usize,
    ) {
        if cycles.len() >= max_cycles {
            return;
        }
        state[node] = 1;
        stack.push(node);
        for &next in &edges[node] {
            if cycles.len() >= max_cycles {
                break;
            }
            match state[next] {
                1 => {
                    let start = stack.iter().position(|&s| s == next).unwrap_or(0);
                    let mut path = stack[start..].to_vec();
                    path.push(next);
                    cycles.push(StepCycle { start_step: next, path });
                }
                0 => dfs(next, edges, state, stack, cycles, max_cycles),
                _ => {}
            }
        }
        stack.pop();
        state[node] = 2;
    }

    for start in 1..=n {
        if state[start] == 0 {
            dfs(start, &edges, &mut state, &mut stack, &mut cycles, max_cycles);
        }
    }
    cycles
}

/// Run all invariant checks over a slice.
pub fn validate_slice(slice: &KnowledgeSlice) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    // Screen signatures.
    for screen in &slice.screens {
        if !screen.state_signature.is_within_limits() {
            issues.push(ValidationIssue::error(
                "signature_too_long",
                format!("screen '{}' has an indicator over the length cap", screen.name),
                &screen.screen_id,
            ));
        }
        if screen.content_type == ContentType::Documentation
            && !screen.state_signature.is_empty()
        {
            issues.push(ValidationIssue::error(
                "documentation_signature_nonempty",
                format!("documentation screen '{}' must have an empty signature", screen.name),
                &screen.screen_id,
            ));
        }
        if screen.knowledge_id != slice.knowledge_id {
            issues.push(ValidationIssue::error(
                "knowledge_id_mismatch",
                "screen belongs to a different knowledge id",
                &screen.screen_id,
            ));
        }
    }

    // Task linearity and loop placement.
    for task in &slice.tasks {
        for (step, target) in backward_references(task) {
            issues.push(ValidationIssue::error(
                "backward_step_reference",
                format!("task '{}' step {} references earlier step {}", task.name, step, target),
                &task.task_id,
            ));
        }
        for step in &task.steps {
            if LOOP_PHRASE.is_match(&step.description) && !task.iterator_spec.is_looping() {
                issues.push(ValidationIssue::error(
                    "loop_in_steps",
                    format!(
                        "task '{}' step {} contains loop semantics outside iterator_spec",
                        task.name, step.order
                    ),
                    &task.task_id,
                ));
            }
        }
        for cycle in find_step_cycles(task, 5) {
            issues.push(ValidationIssue::error(
                "step_cycle",
                format!(
                    "task '{}' has a step cycle starting at step {} ({:?})",
                    task.name, cycle.start_step, cycle.path
                ),
                &task.task_id,
            ));
        }
    }

    // Transition endpoints resolve within the slice.
    for transition in &slice.transitions {
        for endpoint in [&transition.from_screen_id, &transition.to_screen_id] {
            if slice.screen(endpoint).is_none() {
                issues.push(ValidationIssue::error(
                    "unresolved_transition_endpoint",
                    format!("transition references unknown screen '{}'", endpoint),
                    &transition.transition_id,
                ));
            }
        }
        if !(0.0..=1.0).contains(&transition.reliability) {
            issues.push(ValidationIssue::error(
                "reliability_out_of_range",
                format!("reliability {} outside [0, 1]", transition.reliability),
                &transition.transition_id,
            ));
        }
    }

    // Group coverage: every screen in at least one group, every group with at
    // least one recovery edge.
    if !slice.groups.is_empty() {
        for screen in &slice.screens {
            let covered = slice.groups.iter().any(|g| g.screen_ids.contains(&screen.screen_id));
            if !covered {
                issues.push(ValidationIssue::error(
                    "screen_without_group",
                    format!("screen '{}' belongs to no group", screen.name),
                    &screen.screen_id,
                ));
            }
        }
    } else if !slice.screens.is_empty() {
        issues.push(ValidationIssue::warning(
            "no_groups",
            "slice has screens but no screen groups",
            &slice.knowledge_id,
        ));
    }
    for group in &slice.groups {
        if group.recovery_edges.is_empty() {
            issues.push(ValidationIssue::error(
                "group_without_recovery",
                format!("group '{}' has no recovery edge", group.name),
                &group.group_id,
            ));
        }
    }

    issues
}

/// Whether any finding is an error (fails the workflow's validate phase).
pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(|i| i.severity == Severity::Error)
}

// =============================================================================
// TESTS
// =============================================================================
