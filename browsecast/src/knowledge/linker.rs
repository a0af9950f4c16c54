//! Cross-reference linker
//!
//! Runs after all extractors complete and establishes bidirectional
//! references between entities of one knowledge slice:
//! - Task -> Screen via `page_url` match against screen URL patterns
//! - Action -> Screen by context (video-sourced name mention, navigation URL)
//! - BusinessFunction -> Screen by fuzzy name match over `screens_mentioned`
//! - Workflow -> Screens/Tasks/Actions by parsing step references
//! - Transition -> Screens/Actions by direct id match
//!
//! Every link is a set-insert on both endpoints, so re-running the pass is
//! idempotent and concurrent updates converge.

use tracing::debug;

use crate::extract::similarity;

use super::KnowledgeSlice;

/// Fuzzy threshold for business-function and workflow name resolution.
pub const NAME_LINK_THRESHOLD: f64 = 0.6;

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

/// Summary of links established by one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub task_screen_links: usize,
    pub action_screen_links: usize,
    pub function_screen_links: usize,
    pub workflow_links: usize,
    pub transition_links: usize,
}

impl LinkReport {
    /// Total links established
    pub fn total(&self) -> usize {
        self.task_screen_links
            + self.action_screen_links
            + self.function_screen_links
            + self.workflow_links
            + self.transition_links
    }
}

/// Run the full linking pass over a slice in place.
pub fn link_slice(slice: &mut KnowledgeSlice) -> LinkReport {
    let mut report = LinkReport::default();

    // Task -> Screen via page_url against url_patterns.
    for ti in 0..slice.tasks.len() {
        let Some(page_url) = slice.tasks[ti].page_url.clone() else { continue };
        let matched: Vec<String> = slice
            .screens
            .iter()
            .filter(|s| s.matches_url(&page_url))
            .map(|s| s.screen_id.clone())
            .collect();
        for screen_id in matched {
            let task_id = slice.tasks[ti].task_id.clone();
            push_unique(&mut slice.tasks[ti].screen_ids, &screen_id);
            if let Some(screen) = slice.screens.iter_mut().find(|s| s.screen_id == screen_id) {
                push_unique(&mut screen.task_ids, &task_id);
            }
            report.task_screen_links += 1;
        }
    }

    // Action -> Screen by context.
    for ai in 0..slice.actions.len() {
        let action = &slice.actions[ai];
        let action_id = action.action_id.clone();
        let mut matched: Vec<String> = Vec::new();

        // Video-sourced action: its name mentions a screen.
        if action.provenance.extraction_source.contains("video") {
            for screen in &slice.screens {
                let name = screen.name.to_lowercase();
                if action.name.to_lowercase().contains(&name)
                    || similarity(&action.name, &screen.name) >= NAME_LINK_THRESHOLD
                {
                    matched.push(screen.screen_id.clone());
                }
            }
        }
        // Navigation action: its target URL matches a screen pattern.
        if action.action_type == super::KnowledgeActionType::Navigate {
            if let Some(url) = action
                .browser_use_action
                .as_ref()
                .and_then(|a| a.pointer("/params/url"))
                .and_then(|v| v.as_str())
            {
                for screen in &slice.screens {
                    if screen.matches_url(url) {
                        matched.push(screen.screen_id.clone());
                    }
                }
            }
        }

        for screen_id in matched {
            push_unique(&mut slice.actions[ai].screen_ids, &screen_id);
            if let Some(screen) = slice.screens.iter_mut().find(|s| s.screen_id == screen_id) {
                push_unique(&mut screen.action_ids, &action_id);
            }
            report.action_screen_links += 1;
        }
    }

    // BusinessFunction -> Screen by fuzzy name match; documentation screens
    // are eligible targets too.
    for fi in 0..slice.functions.len() {
        let mentions = slice.functions[fi].screens_mentioned.clone();
        let function_id = slice.functions[fi].function_id.clone();
        for mention in mentions {
            let matched: Option<String> = slice
                .screens
                .iter()
                .map(|s| (s.screen_id.clone(), similarity(&mention, &s.name)))
                .filter(|(_, score)| *score >= NAME_LINK_THRESHOLD)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(id, _)| id);
            if let Some(screen_id) = matched {
                push_unique(&mut slice.functions[fi].screen_ids, &screen_id);
                if let Some(screen) = slice.screens.iter_mut().find(|s| s.screen_id == screen_id) {
                    push_unique(&mut screen.business_function_ids, &function_id);
                }
                report.function_screen_links += 1;
            }
        }
    }

    // Workflow -> Screens/Tasks/Actions by parsing step references.
    for wi in 0..slice.workflows.len() {
        let refs = slice.workflows[wi].step_refs.clone();
        for step_ref in refs {
            let screen_hit = slice
                .screens
                .iter()
                .find(|s| similarity(&step_ref, &s.name) >= NAME_LINK_THRESHOLD)
                .map(|s| s.screen_id.clone());
            if let Some(id) = screen_hit {
                push_unique(&mut slice.workflows[wi].screen_ids, &id);
                report.workflow_links += 1;
            }
            let task_hit = slice
                .tasks
                .iter()
                .find(|t| similarity(&step_ref, &t.name) >= NAME_LINK_THRESHOLD)
                .map(|t| t.task_id.clone());
            if let Some(id) = task_hit {
                push_unique(&mut slice.workflows[wi].task_ids, &id);
                report.workflow_links += 1;
            }
            let action_hit = slice
                .actions
                .iter()
                .find(|a| similarity(&step_ref, &a.name) >= NAME_LINK_THRESHOLD)
                .map(|a| a.action_id.clone());
            if let Some(id) = action_hit {
                push_unique(&mut slice.workflows[wi].action_ids, &id);
                report.workflow_links += 1;
            }
        }
    }

    // Transition -> Screens/Actions by direct id match.
    for ti in 0..slice.transitions.len() {
        let (transition_id, from_id, to_id, trigger) = {
            let t = &slice.transitions[ti];
            (
                t.transition_id.clone(),
                t.from_screen_id.clone(),
                t.to_screen_id.clone(),
                t.trigger_action_id.clone(),
            )
        };
        for screen_id in [&from_id, &to_id] {
            if let Some(screen) = slice.screens.iter_mut().find(|s| &s.screen_id == screen_id) {
                push_unique(&mut screen.transition_ids, &transition_id);
                report.transition_links += 1;
            }
        }
        if let Some(action_id) = trigger {
            if let Some(action) = slice.actions.iter_mut().find(|a| a.action_id == action_id) {
                push_unique(&mut action.screen_ids, &from_id);
                report.transition_links += 1;
            }
        }
    }

    debug!(knowledge_id = %slice.knowledge_id, links = report.total(), "link pass complete");
    report
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{
        BusinessFunction, ContentType, IoSpec, IteratorSpec, KnowledgeAction, KnowledgeActionType,
        Provenance, Screen, StateSignature, Task, Transition, TransitionCost,
    };

    fn screen(id: &str, name: &str, patterns: Vec<String>) -> Screen {
        Screen {
            screen_id: id.into(),
            knowledge_id: "k1".into(),
            name: name.into(),
            content_type: ContentType::WebUi,
            is_actionable: true,
            url_patterns: patterns,
            state_signature: StateSignature::default(),
            ui_elements: Vec::new(),
            regions: Vec::new(),
            layout_structure: None,
            action_ids: Vec::new(),
            task_ids: Vec::new(),
            transition_ids: Vec::new(),
            business_function_ids: Vec::new(),
            group_ids: Vec::new(),
            provenance: Provenance::new("docs", 0.9),
        }
    }

    #[test]
    fn test_task_screen_link_by_url() {
        let mut slice = KnowledgeSlice::new("k1");
        slice.screens.push(screen(
            "s1",
            "Billing",
            vec![r"https://example\.com/billing(/.*)?".into()],
        ));
        slice.tasks.push(Task {
            task_id: "t1".into(),
            knowledge_id: "k1".into(),
            name: "Update card".into(),
            steps: Vec::new(),
            io_spec: IoSpec::default(),
            iterator_spec: IteratorSpec::default(),
            page_url: Some("https://example.com/billing/payment".into()),
            screen_ids: Vec::new(),
            provenance: Provenance::new("docs", 0.9),
        });

        let report = link_slice(&mut slice);
        assert_eq!(report.task_screen_links, 1);
        assert_eq!(slice.tasks[0].screen_ids, vec!["s1"]);
        assert_eq!(slice.screens[0].task_ids, vec!["t1"]);
    }

    #[test]
    fn test_function_screen_fuzzy_link() {
        let mut slice = KnowledgeSlice::new("k1");
        slice.screens.push(screen("s1", "Invoice History", Vec::new()));
        slice.functions.push(BusinessFunction {
            function_id: "f1".into(),
            knowledge_id: "k1".into(),
            name: "Billing".into(),
            description: String::new(),
            screens_mentioned: vec!["invoice history".into()],
            screen_ids: Vec::new(),
            task_ids: Vec::new(),
            provenance: Provenance::new("docs", 0.9),
        });

        let report = link_slice(&mut slice);
        assert_eq!(report.function_screen_links, 1);
        assert_eq!(slice.functions[0].screen_ids, vec!["s1"]);
        assert_eq!(slice.screens[0].business_function_ids, vec!["f1"]);
    }

    #[test]
    fn test_transition_direct_links() {
        let mut slice = KnowledgeSlice::new("k1");
        slice.screens.push(screen("a", "A", Vec::new()));
        slice.screens.push(screen("b", "B", Vec::new()));
        slice.actions.push(KnowledgeAction {
            action_id: "act".into(),
            knowledge_id: "k1".into(),
            name: "Click next".into(),
            action_type: KnowledgeActionType::Click,
            selector: None,
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            idempotent: false,
            reversible_by: None,
            browser_use_action: None,
            confidence_score: 0.9,
            delay_intelligence: None,
            screen_ids: Vec::new(),
            provenance: Provenance::new("docs", 0.9),
        });
        slice.transitions.push(Transition {
            transition_id: "tr".into(),
            knowledge_id: "k1".into(),
            from_screen_id: "a".into(),
            to_screen_id: "b".into(),
            trigger_action_id: Some("act".into()),
            conditions: Vec::new(),
            effects: Vec::new(),
            cost: TransitionCost::default(),
            reliability: 0.95,
            delay_intelligence: None,
            provenance: Provenance::new("docs", 0.9),
        });

        link_slice(&mut slice);
        assert_eq!(slice.screens[0].transition_ids, vec!["tr"]);
        assert_eq!(slice.screens[1].transition_ids, vec!["tr"]);
        assert_eq!(slice.actions[0].screen_ids, vec!["a"]);
    }

    #[test]
    fn test_link_pass_is_idempotent() {
        let mut slice = KnowledgeSlice::new("k1");
        slice.screens.push(screen(
            "s1",
            "Billing",
            vec![r"https://example\.com/billing".into()],
        ));
        slice.tasks.push(Task {
            task_id: "t1".into(),
            knowledge_id: "k1".into(),
            name: "Pay".into(),
            steps: Vec::new(),
            io_spec: IoSpec::default(),
            iterator_spec: IteratorSpec::default(),
            page_url: Some("https://example.com/billing".into()),
            screen_ids: Vec::new(),
            provenance: Provenance::new("docs", 0.9),
        });

        link_slice(&mut slice);
        link_slice(&mut slice);
        assert_eq!(slice.tasks[0].screen_ids.len(), 1);
        assert_eq!(slice.screens[0].task_ids.len(), 1);
    }
}
