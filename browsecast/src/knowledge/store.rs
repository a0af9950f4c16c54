//! Knowledge persistence
//!
//! Typed reads and writes over the [`DocStore`] capability. Writes are
//! upsert-on-conflict; reads by `knowledge_id` return a full slice.
//! Replace-by-id deletes every collection for the id in bulk before the new
//! extraction upserts, guaranteeing no orphans.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::capabilities::DocStore;
use crate::delay::{DelayKey, DelayStats};
use crate::error::Result;
use crate::ingest::ContentChunk;

use super::{
    collections, BusinessFeature, BusinessFunction, KnowledgeAction, KnowledgeSlice, Screen,
    ScreenGroup, Task, Transition, UserFlow, WorkflowEntity,
};

/// Typed facade over the document store.
pub struct KnowledgeStore {
    store: Arc<dyn DocStore>,
}

impl KnowledgeStore {
    pub fn new(store: Arc<dyn DocStore>) -> Self {
        Self { store }
    }

    /// The underlying store capability
    pub fn doc_store(&self) -> Arc<dyn DocStore> {
        self.store.clone()
    }

    async fn save<T: serde::Serialize>(&self, collection: &str, id: &str, entity: &T) -> Result<()> {
        self.store.upsert(collection, id, serde_json::to_value(entity)?).await
    }

    fn parse_all<T: serde::de::DeserializeOwned>(docs: Vec<serde_json::Value>, what: &str) -> Vec<T> {
        docs.into_iter()
            .filter_map(|doc| match serde_json::from_value(doc) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!(collection = what, error = %e, "skipping unparseable document");
                    None
                }
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Typed writes
    // -------------------------------------------------------------------------

    pub async fn save_screen(&self, screen: &Screen) -> Result<()> {
        self.save(collections::SCREENS, &screen.screen_id, screen).await
    }

    pub async fn save_action(&self, action: &KnowledgeAction) -> Result<()> {
        self.save(collections::ACTIONS, &action.action_id, action).await
    }

    pub async fn save_task(&self, task: &Task) -> Result<()> {
        self.save(collections::TASKS, &task.task_id, task).await
    }

    pub async fn save_transition(&self, transition: &Transition) -> Result<()> {
        self.save(collections::TRANSITIONS, &transition.transition_id, transition).await
    }

    pub async fn save_group(&self, group: &ScreenGroup) -> Result<()> {
        self.save(collections::SCREEN_GROUPS, &group.group_id, group).await
    }

    /// Persist an entire slice with per-entity upserts.
    pub async fn save_slice(&self, slice: &KnowledgeSlice) -> Result<()> {
        for screen in &slice.screens {
            self.save_screen(screen).await?;
        }
        for action in &slice.actions {
            self.save_action(action).await?;
        }
        for task in &slice.tasks {
            self.save_task(task).await?;
        }
        for transition in &slice.transitions {
            self.save_transition(transition).await?;
        }
        for group in &slice.groups {
            self.save_group(group).await?;
        }
        for function in &slice.functions {
            self.save(collections::BUSINESS_FUNCTIONS, &function.function_id, function).await?;
        }
        for flow in &slice.flows {
            self.save(collections::USER_FLOWS, &flow.flow_id, flow).await?;
        }
        for workflow in &slice.workflows {
            self.save(collections::WORKFLOWS, &workflow.workflow_id, workflow).await?;
        }
        for feature in &slice.features {
            self.save(collections::FEATURES, &feature.feature_id, feature).await?;
        }
        debug!(knowledge_id = %slice.knowledge_id, entities = slice.entity_count(), "slice saved");
        Ok(())
    }

    /// Persist content chunks, skipping chunks whose `content_hash` is
    /// already stored for this knowledge id.
    pub async fn save_chunks(&self, chunks: &[ContentChunk]) -> Result<usize> {
        let Some(first) = chunks.first() else { return Ok(0) };
        let existing = self
            .store
            .find_by_knowledge_id(collections::CHUNKS, &first.knowledge_id)
            .await?;
        let known: std::collections::HashSet<String> = existing
            .iter()
            .filter_map(|d| d.get("content_hash").and_then(|v| v.as_str()).map(String::from))
            .collect();

        let mut written = 0;
        for chunk in chunks {
            if known.contains(&chunk.content_hash) {
                continue;
            }
            self.save(collections::CHUNKS, &chunk.chunk_id, chunk).await?;
            written += 1;
        }
        Ok(written)
    }

    // -------------------------------------------------------------------------
    // Typed reads
    // -------------------------------------------------------------------------

    pub async fn get_screen(&self, screen_id: &str) -> Result<Option<Screen>> {
        Ok(self
            .store
            .get(collections::SCREENS, screen_id)
            .await?
            .and_then(|doc| serde_json::from_value(doc).ok()))
    }

    pub async fn get_action(&self, action_id: &str) -> Result<Option<KnowledgeAction>> {
        Ok(self
            .store
            .get(collections::ACTIONS, action_id)
            .await?
            .and_then(|doc| serde_json::from_value(doc).ok()))
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self
            .store
            .get(collections::TASKS, task_id)
            .await?
            .and_then(|doc| serde_json::from_value(doc).ok()))
    }

    pub async fn get_transition(&self, transition_id: &str) -> Result<Option<Transition>> {
        Ok(self
            .store
            .get(collections::TRANSITIONS, transition_id)
            .await?
            .and_then(|doc| serde_json::from_value(doc).ok()))
    }

    /// Load the full slice for one knowledge id.
    pub async fn load_slice(&self, knowledge_id: &str) -> Result<KnowledgeSlice> {
        let mut slice = KnowledgeSlice::new(knowledge_id);
        slice.screens = Self::parse_all::<Screen>(
            self.store.find_by_knowledge_id(collections::SCREENS, knowledge_id).await?,
            collections::SCREENS,
        );
        slice.actions = Self::parse_all::<KnowledgeAction>(
            self.store.find_by_knowledge_id(collections::ACTIONS, knowledge_id).await?,
            collections::ACTIONS,
        );
        slice.tasks = Self::parse_all::<Task>(
            self.store.find_by_knowledge_id(collections::TASKS, knowledge_id).await?,
            collections::TASKS,
        );
        slice.transitions = Self::parse_all::<Transition>(
            self.store.find_by_knowledge_id(collections::TRANSITIONS, knowledge_id).await?,
            collections::TRANSITIONS,
        );
        slice.groups = Self::parse_all::<ScreenGroup>(
            self.store.find_by_knowledge_id(collections::SCREEN_GROUPS, knowledge_id).await?,
            collections::SCREEN_GROUPS,
        );
        slice.functions = Self::parse_all::<BusinessFunction>(
            self.store
                .find_by_knowledge_id(collections::BUSINESS_FUNCTIONS, knowledge_id)
                .await?,
            collections::BUSINESS_FUNCTIONS,
        );
        slice.flows = Self::parse_all::<UserFlow>(
            self.store.find_by_knowledge_id(collections::USER_FLOWS, knowledge_id).await?,
            collections::USER_FLOWS,
        );
        slice.workflows = Self::parse_all::<WorkflowEntity>(
            self.store.find_by_knowledge_id(collections::WORKFLOWS, knowledge_id).await?,
            collections::WORKFLOWS,
        );
        slice.features = Self::parse_all::<BusinessFeature>(
            self.store.find_by_knowledge_id(collections::FEATURES, knowledge_id).await?,
            collections::FEATURES,
        );
        Ok(slice)
    }

    /// Stored chunks for a knowledge id.
    pub async fn load_chunks(&self, knowledge_id: &str) -> Result<Vec<ContentChunk>> {
        Ok(Self::parse_all(
            self.store.find_by_knowledge_id(collections::CHUNKS, knowledge_id).await?,
            collections::CHUNKS,
        ))
    }

    // -------------------------------------------------------------------------
    // Replace-by-id
    // -------------------------------------------------------------------------

    /// Bulk-delete every entity for a knowledge id across all collections.
    /// Returns the number of removed documents.
    pub async fn replace_knowledge(&self, knowledge_id: &str) -> Result<u64> {
        let mut removed = 0;
        for collection in collections::ALL {
            removed += self.store.delete_by_knowledge_id(collection, knowledge_id).await?;
        }
        if removed > 0 {
            debug!(knowledge_id, removed, "knowledge replaced");
        }
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Delay intelligence flush
    // -------------------------------------------------------------------------

    /// Merge drained delay statistics into their owning actions and
    /// transitions. Idempotent last-write-wins per entity; unknown ids are
    /// skipped.
    pub async fn apply_delay_stats(&self, stats: &[(DelayKey, DelayStats)]) -> Result<usize> {
        let mut applied = 0;
        for (key, delay) in stats {
            match key {
                DelayKey::ScreenAction { action_id, .. } => {
                    if let Some(mut action) = self.get_action(action_id).await? {
                        action.delay_intelligence = Some(delay.clone());
                        self.save_action(&action).await?;
                        applied += 1;
                    }
                }
                DelayKey::Transition { transition_id } => {
                    if let Some(mut transition) = self.get_transition(transition_id).await? {
                        transition.delay_intelligence = Some(delay.clone());
                        self.save_transition(&transition).await?;
                        applied += 1;
                    }
                }
            }
        }
        Ok(applied)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryDocStore;
    use crate::delay::DelaySample;
    use crate::knowledge::{ContentType, Provenance, StateSignature};

    fn screen(id: &str, kid: &str) -> Screen {
        Screen {
            screen_id: id.into(),
            knowledge_id: kid.into(),
            name: format!("Screen {}", id),
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

    fn store() -> KnowledgeStore {
        KnowledgeStore::new(Arc::new(MemoryDocStore::new()))
    }

    #[tokio::test]
    async fn test_save_and_load_slice() {
        let store = store();
        let mut slice = KnowledgeSlice::new("k1");
        slice.screens.push(screen("s1", "k1"));
        slice.screens.push(screen("s2", "k1"));
        store.save_slice(&slice).await.unwrap();

        let loaded = store.load_slice("k1").await.unwrap();
        assert_eq!(loaded.screens.len(), 2);
        assert_eq!(loaded.knowledge_id, "k1");
    }

    #[tokio::test]
    async fn test_replace_by_id_leaves_no_orphans() {
        let store = store();

        let mut first = KnowledgeSlice::new("k1");
        for i in 0..3 {
            first.screens.push(screen(&format!("a{}", i), "k1"));
        }
        store.save_slice(&first).await.unwrap();

        // Another knowledge id is untouched by the replace.
        let mut other = KnowledgeSlice::new("k2");
        other.screens.push(screen("other", "k2"));
        store.save_slice(&other).await.unwrap();

        let removed = store.replace_knowledge("k1").await.unwrap();
        assert_eq!(removed, 3);

        let mut second = KnowledgeSlice::new("k1");
        for i in 0..2 {
            second.screens.push(screen(&format!("b{}", i), "k1"));
        }
        store.save_slice(&second).await.unwrap();

        let loaded = store.load_slice("k1").await.unwrap();
        assert_eq!(loaded.screens.len(), 2);
        assert!(loaded.screens.iter().all(|s| s.screen_id.starts_with('b')));
        assert_eq!(store.load_slice("k2").await.unwrap().screens.len(), 1);
    }

    #[tokio::test]
    async fn test_chunk_dedup_by_content_hash() {
        let store = store();
        let chunk = ContentChunk::new("k1", "src-1", crate::ingest::SourceType::Documentation, 0, "hello world");
        assert_eq!(store.save_chunks(&[chunk.clone()]).await.unwrap(), 1);

        // Same content, new chunk id: deduplicated by hash.
        let twin = ContentChunk::new("k1", "src-2", crate::ingest::SourceType::Documentation, 0, "hello world");
        assert_eq!(store.save_chunks(&[twin]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_apply_delay_stats_to_action() {
        let store = store();
        let action = KnowledgeAction {
            action_id: "act-1".into(),
            knowledge_id: "k1".into(),
            name: "Click save".into(),
            action_type: crate::knowledge::KnowledgeActionType::Click,
            selector: None,
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            idempotent: false,
            reversible_by: None,
            browser_use_action: None,
            confidence_score: 0.9,
            delay_intelligence: None,
            screen_ids: Vec::new(),
            provenance: Provenance::new("test", 0.9),
        };
        store.save_action(&action).await.unwrap();

        let stats = DelayStats::from_samples(&[DelaySample {
            duration_ms: 150,
            url_changed: false,
            dom_stable: true,
            network_idle: true,
        }])
        .unwrap();
        let applied = store
            .apply_delay_stats(&[(DelayKey::screen_action("s1", "act-1"), stats)])
            .await
            .unwrap();
        assert_eq!(applied, 1);

        let loaded = store.get_action("act-1").await.unwrap().unwrap();
        assert!(loaded.delay_intelligence.is_some());
    }
}
