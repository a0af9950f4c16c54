//! Agent-facing REST protocol
//!
//! Typed request/response records and the handler behind the REST surface:
//! ingestion start and presigned uploads, graph queries, entity reads,
//! workflow status, and verification triggering. The handler is
//! transport-agnostic; an HTTP server binds routes to these methods and maps
//! errors to statuses through [`crate::error::ErrorCode::http_status`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::error::{Error, ErrorBody, ErrorCode, Result};
use crate::ingest::{
    validate_presigned, FileMetadata, IngestSource, PresignedReference, UploadFetcher,
};
use crate::knowledge::graph::{GraphIndex, Neighbor, PathHop};
use crate::knowledge::store::KnowledgeStore;
use crate::knowledge::{KnowledgeAction, Screen, Task, Transition};
use crate::telemetry::PerformanceMonitor;
use crate::workflow::{ExtractionJob, JobStatus, KnowledgeWorkflow};

// =============================================================================
// REQUEST / RESPONSE RECORDS
// =============================================================================

/// `POST /ingest/start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestStartRequest {
    /// Re-using an existing id triggers replace-by-id semantics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_id: Option<String>,
    pub sources: Vec<IngestSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestStartResponse {
    pub job_id: String,
    pub knowledge_id: String,
}

/// `POST /ingest/upload`: single item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadItem {
    pub s3_reference: PresignedReference,
    pub file_metadata: FileMetadata,
}

/// `POST /ingest/upload`: single or batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UploadRequest {
    Single {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        knowledge_id: Option<String>,
        s3_reference: PresignedReference,
        file_metadata: FileMetadata,
    },
    Batch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        knowledge_id: Option<String>,
        items: Vec<UploadItem>,
    },
}

/// `POST /graph/query` query types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphQueryType {
    FindPath,
    GetNeighbors,
    SearchScreens,
    GetTransitions,
}

/// `POST /graph/query`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQueryRequest {
    pub knowledge_id: String,
    pub query_type: GraphQueryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_screen_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_screen_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// `POST /graph/query` response payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphQueryResponse {
    Path { hops: Option<Vec<PathHop>> },
    Neighbors { neighbors: Vec<Neighbor> },
    Screens { screens: Vec<Screen> },
    Transitions { transitions: Vec<Transition> },
}

/// `POST /verify/start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyStartRequest {
    pub knowledge_id: String,
}

/// HTTP-shaped response pair: status code plus JSON body.
pub fn http_response<T: Serialize>(result: Result<T>) -> (u16, serde_json::Value) {
    match result {
        Ok(value) => (200, serde_json::to_value(value).unwrap_or_default()),
        Err(e) => {
            let body: ErrorBody = e.to_body();
            (e.http_status(), serde_json::to_value(body).unwrap_or_default())
        }
    }
}

// =============================================================================
// HANDLER
// =============================================================================

/// Transport-agnostic REST handler.
pub struct GatewayHandler {
    workflow: Arc<KnowledgeWorkflow>,
    store: Arc<KnowledgeStore>,
    uploads: UploadFetcher,
    monitor: Arc<PerformanceMonitor>,
    verification_enabled: bool,
}

impl GatewayHandler {
    pub fn new(workflow: Arc<KnowledgeWorkflow>, verification_enabled: bool) -> Self {
        let store = workflow.store();
        Self {
            workflow,
            store,
            uploads: UploadFetcher::new(),
            monitor: Arc::new(PerformanceMonitor::new()),
            verification_enabled,
        }
    }

    /// The endpoint monitor
    pub fn monitor(&self) -> Arc<PerformanceMonitor> {
        self.monitor.clone()
    }

    fn track<T>(&self, endpoint: &str, started: Instant, result: &Result<T>) {
        let status = match result {
            Ok(_) => 200,
            Err(e) => e.http_status(),
        };
        self.monitor.track_endpoint(endpoint, started.elapsed(), status);
    }

    /// `POST /ingest/start`
    pub async fn ingest_start(&self, request: IngestStartRequest) -> Result<IngestStartResponse> {
        let started = Instant::now();
        let result = self.ingest_start_inner(request).await;
        self.track("/ingest/start", started, &result);
        result
    }

    async fn ingest_start_inner(
        &self,
        request: IngestStartRequest,
    ) -> Result<IngestStartResponse> {
        if request.sources.is_empty() {
            return Err(Error::invalid_params("at least one source required"));
        }
        let knowledge_id = request
            .knowledge_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut sources = request.sources;
        for source in &mut sources {
            source.knowledge_id = knowledge_id.clone();
        }
        let job = ExtractionJob::new(&knowledge_id, sources);
        let job_id = job.job_id.clone();
        info!(job = %job_id, knowledge_id = %knowledge_id, "ingestion started");

        let workflow = self.workflow.clone();
        tokio::spawn(async move {
            let _ = workflow.run(job).await;
        });
        Ok(IngestStartResponse { job_id, knowledge_id })
    }

    /// `POST /ingest/upload`: validate presigned references, download the
    /// objects, and start extraction over the resulting sources.
    pub async fn ingest_upload(&self, request: UploadRequest) -> Result<IngestStartResponse> {
        let started = Instant::now();
        let result = self.ingest_upload_inner(request).await;
        self.track("/ingest/upload", started, &result);
        result
    }

    async fn ingest_upload_inner(&self, request: UploadRequest) -> Result<IngestStartResponse> {
        let (knowledge_id, items) = match request {
            UploadRequest::Single { knowledge_id, s3_reference, file_metadata } => {
                (knowledge_id, vec![UploadItem { s3_reference, file_metadata }])
            }
            UploadRequest::Batch { knowledge_id, items } => (knowledge_id, items),
        };
        if items.is_empty() {
            return Err(Error::invalid_params("upload batch is empty"));
        }
        // Validate every reference before downloading any of them.
        for item in &items {
            validate_presigned(&item.s3_reference)?;
        }
        let knowledge_id = knowledge_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let fetches = items
            .iter()
            .map(|item| self.uploads.fetch(&knowledge_id, &item.s3_reference, &item.file_metadata));
        let sources: Vec<IngestSource> = futures::future::join_all(fetches)
            .await
            .into_iter()
            .collect::<Result<_>>()?;
        self.ingest_start_inner(IngestStartRequest { knowledge_id: Some(knowledge_id), sources })
            .await
    }

    /// `POST /graph/query`
    pub async fn graph_query(&self, request: GraphQueryRequest) -> Result<GraphQueryResponse> {
        let started = Instant::now();
        let result = self.graph_query_inner(request).await;
        self.track("/graph/query", started, &result);
        result
    }

    async fn graph_query_inner(&self, request: GraphQueryRequest) -> Result<GraphQueryResponse> {
        let slice = self.store.load_slice(&request.knowledge_id).await?;
        let index = GraphIndex::build(&slice);

        match request.query_type {
            GraphQueryType::FindPath => {
                let from = request
                    .from_screen_id
                    .ok_or_else(|| Error::invalid_params("find_path requires from_screen_id"))?;
                let to = request
                    .to_screen_id
                    .ok_or_else(|| Error::invalid_params("find_path requires to_screen_id"))?;
                Ok(GraphQueryResponse::Path { hops: index.shortest_path(&from, &to) })
            }
            GraphQueryType::GetNeighbors => {
                let screen_id = request
                    .screen_id
                    .ok_or_else(|| Error::invalid_params("get_neighbors requires screen_id"))?;
                Ok(GraphQueryResponse::Neighbors { neighbors: index.neighbors(&screen_id).to_vec() })
            }
            GraphQueryType::SearchScreens => {
                let query = request
                    .query
                    .ok_or_else(|| Error::invalid_params("search_screens requires query"))?;
                Ok(GraphQueryResponse::Screens {
                    screens: index.search_screens(&query).into_iter().cloned().collect(),
                })
            }
            GraphQueryType::GetTransitions => {
                Ok(GraphQueryResponse::Transitions { transitions: slice.transitions })
            }
        }
    }

    /// `GET /screens/{id}`
    pub async fn get_screen(&self, screen_id: &str) -> Result<Screen> {
        let started = Instant::now();
        let result = self.store.get_screen(screen_id).await.and_then(|screen| {
            screen.ok_or_else(|| {
                Error::validation(ErrorCode::NotFound, format!("no screen {}", screen_id))
            })
        });
        self.track("/screens/{id}", started, &result);
        result
    }

    /// `GET /tasks/{id}`
    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        let started = Instant::now();
        let result = self.store.get_task(task_id).await.and_then(|task| {
            task.ok_or_else(|| Error::validation(ErrorCode::NotFound, format!("no task {}", task_id)))
        });
        self.track("/tasks/{id}", started, &result);
        result
    }

    /// `GET /actions/{id}`
    pub async fn get_action(&self, action_id: &str) -> Result<KnowledgeAction> {
        let started = Instant::now();
        let result = self.store.get_action(action_id).await.and_then(|action| {
            action.ok_or_else(|| {
                Error::validation(ErrorCode::NotFound, format!("no action {}", action_id))
            })
        });
        self.track("/actions/{id}", started, &result);
        result
    }

    /// `GET /transitions/{id}`
    pub async fn get_transition(&self, transition_id: &str) -> Result<Transition> {
        let started = Instant::now();
        let result = self.store.get_transition(transition_id).await.and_then(|transition| {
            transition.ok_or_else(|| {
                Error::validation(ErrorCode::NotFound, format!("no transition {}", transition_id))
            })
        });
        self.track("/transitions/{id}", started, &result);
        result
    }

    /// List variants by knowledge id.
    pub async fn list_screens(&self, knowledge_id: &str) -> Result<Vec<Screen>> {
        Ok(self.store.load_slice(knowledge_id).await?.screens)
    }

    /// `GET /workflows/status/{job_id}`
    pub async fn workflow_status(&self, job_id: &str) -> Result<JobStatus> {
        let started = Instant::now();
        let result = self.workflow.jobs().get(job_id).ok_or_else(|| {
            Error::validation(ErrorCode::NotFound, format!("no job {}", job_id))
        });
        self.track("/workflows/status/{job_id}", started, &result);
        result
    }

    /// `POST /verify/start`
    pub async fn verify_start(&self, request: VerifyStartRequest) -> Result<IngestStartResponse> {
        let started = Instant::now();
        let result = if !self.verification_enabled {
            Err(Error::validation(
                ErrorCode::FeatureDisabled,
                "browser verification is disabled",
            ))
        } else {
            // Re-run extraction over the stored chunks with verification on.
            let chunks = self.store.load_chunks(&request.knowledge_id).await?;
            if chunks.is_empty() {
                Err(Error::validation(
                    ErrorCode::NotFound,
                    format!("no stored content for {}", request.knowledge_id),
                ))
            } else {
                let sources = vec![IngestSource::new(
                    &request.knowledge_id,
                    crate::ingest::SourceType::Documentation,
                    "store://chunks",
                )
                .inline_text(
                    chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("\n\n"),
                )];
                self.ingest_start_inner(IngestStartRequest {
                    knowledge_id: Some(request.knowledge_id.clone()),
                    sources,
                })
                .await
            }
        };
        self.track("/verify/start", started, &result);
        result
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventPublisher;
    use crate::capabilities::{
        LocalWorkflowRuntime, MemoryDocStore, MemoryStreamBus, MockTextLlm,
    };
    use crate::ingest::{DocumentationIngester, IngestionRouter, SourceType};
    use crate::now_ms;
    use crate::workflow::JobState;

    fn handler() -> GatewayHandler {
        let workflow = Arc::new(
            KnowledgeWorkflow::builder()
                .runtime(Arc::new(LocalWorkflowRuntime::new()))
                .store(Arc::new(KnowledgeStore::new(Arc::new(MemoryDocStore::new()))))
                .router(Arc::new(
                    IngestionRouter::new().register(Arc::new(DocumentationIngester::new())),
                ))
                .llm(Arc::new(MockTextLlm::new()))
                .events(Arc::new(EventPublisher::new(Arc::new(MemoryStreamBus::new()))))
                .build()
                .unwrap(),
        );
        GatewayHandler::new(workflow, false)
    }

    async fn run_ingest(handler: &GatewayHandler, knowledge_id: &str, text: &str) -> String {
        let response = handler
            .ingest_start(IngestStartRequest {
                knowledge_id: Some(knowledge_id.into()),
                sources: vec![IngestSource::new(
                    knowledge_id,
                    SourceType::Documentation,
                    "inline://doc",
                )
                .inline_text(text)],
            })
            .await
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if let Ok(status) = handler.workflow_status(&response.job_id).await {
                if status.state == JobState::Completed {
                    return response.job_id.clone();
                }
                assert_ne!(status.state, JobState::Failed, "job failed: {:?}", status.errors);
            }
            assert!(std::time::Instant::now() < deadline, "job did not finish");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    const DOC: &str = "\
# Dashboard\n\n\
The Dashboard page shows charts. Navigate from the dashboard to the settings.\n\n\
# Settings\n\n\
The Settings page has your profile.";

    #[tokio::test]
    async fn test_ingest_and_graph_query() {
        let handler = handler();
        run_ingest(&handler, "k1", DOC).await;

        let screens = handler.list_screens("k1").await.unwrap();
        assert!(screens.len() >= 2);
        let dash = screens.iter().find(|s| s.name == "Dashboard").unwrap();
        let settings = screens.iter().find(|s| s.name == "Settings").unwrap();

        let path = handler
            .graph_query(GraphQueryRequest {
                knowledge_id: "k1".into(),
                query_type: GraphQueryType::FindPath,
                from_screen_id: Some(dash.screen_id.clone()),
                to_screen_id: Some(settings.screen_id.clone()),
                screen_id: None,
                query: None,
            })
            .await
            .unwrap();
        let GraphQueryResponse::Path { hops } = path else { panic!("expected path") };
        assert_eq!(hops.unwrap().len(), 1);

        let search = handler
            .graph_query(GraphQueryRequest {
                knowledge_id: "k1".into(),
                query_type: GraphQueryType::SearchScreens,
                from_screen_id: None,
                to_screen_id: None,
                screen_id: None,
                query: Some("settings".into()),
            })
            .await
            .unwrap();
        let GraphQueryResponse::Screens { screens } = search else { panic!("expected screens") };
        assert!(!screens.is_empty());
    }

    #[tokio::test]
    async fn test_entity_get_and_404() {
        let handler = handler();
        run_ingest(&handler, "k1", DOC).await;

        let screens = handler.list_screens("k1").await.unwrap();
        let fetched = handler.get_screen(&screens[0].screen_id).await.unwrap();
        assert_eq!(fetched.screen_id, screens[0].screen_id);

        let missing = handler.get_screen("ghost").await.unwrap_err();
        assert_eq!(missing.http_status(), 404);
        let (status, body) = http_response::<Screen>(Err(missing));
        assert_eq!(status, 404);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_upload_expired_maps_to_410() {
        let handler = handler();
        let request = UploadRequest::Single {
            knowledge_id: None,
            s3_reference: PresignedReference {
                url: "https://bucket.s3/object".into(),
                bucket: "bucket".into(),
                key: "object".into(),
                expires_at_ms: now_ms().saturating_sub(1000),
            },
            file_metadata: FileMetadata {
                filename: "guide.md".into(),
                content_type: Some("text/markdown".into()),
                size_bytes: 10,
            },
        };
        let err = handler.ingest_upload(request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PresignedUrlExpired);
        assert_eq!(err.http_status(), 410);
    }

    #[tokio::test]
    async fn test_upload_batch_validates_all_before_fetching() {
        let handler = handler();
        let ok_reference = PresignedReference {
            url: "https://bucket.s3/a".into(),
            bucket: "bucket".into(),
            key: "a".into(),
            expires_at_ms: now_ms() + 60_000,
        };
        let expired = PresignedReference {
            url: "https://bucket.s3/b".into(),
            bucket: "bucket".into(),
            key: "b".into(),
            expires_at_ms: now_ms().saturating_sub(1),
        };
        let request = UploadRequest::Batch {
            knowledge_id: None,
            items: vec![
                UploadItem {
                    s3_reference: ok_reference,
                    file_metadata: FileMetadata {
                        filename: "a.md".into(),
                        content_type: None,
                        size_bytes: 1,
                    },
                },
                UploadItem {
                    s3_reference: expired,
                    file_metadata: FileMetadata {
                        filename: "b.md".into(),
                        content_type: None,
                        size_bytes: 1,
                    },
                },
            ],
        };
        // The expired reference fails the whole batch before any download.
        let err = handler.ingest_upload(request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PresignedUrlExpired);
    }

    #[tokio::test]
    async fn test_verify_disabled_maps_to_503() {
        let handler = handler();
        let err = handler
            .verify_start(VerifyStartRequest { knowledge_id: "k1".into() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FeatureDisabled);
        assert_eq!(err.http_status(), 503);
    }

    #[tokio::test]
    async fn test_workflow_status_unknown_job() {
        let handler = handler();
        let err = handler.workflow_status("ghost").await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn test_monitor_records_endpoints() {
        let handler = handler();
        let _ = handler.workflow_status("ghost").await;
        let stats = handler.monitor().endpoint_stats("/workflows/status/{job_id}").unwrap();
        assert_eq!(stats.call_count, 1);
        assert_eq!(stats.status_codes[&404], 1);
    }
}
