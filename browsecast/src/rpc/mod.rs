//! Agent-facing RPC surface
//!
//! MCP-style tool calls over a single envelope: `{tool, arguments}` in,
//! `{success, error?, data?}` out. The router validates arguments at the
//! boundary, dispatches to the session manager or the knowledge workflow,
//! and never surfaces a raw panic or exception: every failure is a
//! structured error body.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::actions::ActionRequest;
use crate::config::{SessionConfig, ViewportConfig};
use crate::error::{Error, ErrorBody, ErrorCode, Result};
use crate::ingest::IngestSource;
use crate::knowledge::graph::GraphIndex;
use crate::session::SessionManager;
use crate::telemetry::PerformanceMonitor;
use crate::workflow::{ExtractionJob, KnowledgeWorkflow};

// =============================================================================
// ENVELOPES
// =============================================================================

/// One tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Create a call
    pub fn new(tool: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self { tool: tool.into(), arguments }
    }
}

/// Structured tool response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResponse {
    /// Successful response with data
    pub fn ok(data: serde_json::Value) -> Self {
        Self { success: true, error: None, data: Some(data) }
    }

    /// Failed response from an error
    pub fn err(error: &Error) -> Self {
        Self { success: false, error: Some(error.to_body()), data: None }
    }
}

// =============================================================================
// PARAMETER RECORDS
// =============================================================================

#[derive(Debug, Deserialize)]
struct RoomParams {
    room_name: String,
}

#[derive(Debug, Deserialize)]
struct StartSessionParams {
    room_name: String,
    #[serde(default)]
    initial_url: Option<String>,
    #[serde(default)]
    viewport: Option<ViewportConfig>,
    #[serde(default)]
    participant_identity: Option<String>,
    #[serde(default = "default_stream_mode")]
    stream_mode: bool,
}

fn default_stream_mode() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ExecuteActionParams {
    room_name: String,
    #[serde(flatten)]
    action: ActionRequest,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StartExplorationParams {
    #[serde(default)]
    knowledge_id: Option<String>,
    sources: Vec<IngestSource>,
}

#[derive(Debug, Deserialize)]
struct JobParams {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct KnowledgeParams {
    knowledge_id: String,
}

/// Query types accepted by `query_knowledge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum KnowledgeQueryType {
    Page,
    Search,
    Links,
    SitemapSemantic,
    SitemapFunctional,
}

#[derive(Debug, Deserialize)]
struct QueryKnowledgeParams {
    knowledge_id: String,
    query_type: KnowledgeQueryType,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    screen_id: Option<String>,
}

// =============================================================================
// ROUTER
// =============================================================================

/// Routes tool calls to the session and knowledge tiers.
pub struct ToolRouter {
    manager: Arc<SessionManager>,
    workflow: Arc<KnowledgeWorkflow>,
    monitor: Arc<PerformanceMonitor>,
}

impl ToolRouter {
    pub fn new(manager: Arc<SessionManager>, workflow: Arc<KnowledgeWorkflow>) -> Self {
        Self { manager, workflow, monitor: Arc::new(PerformanceMonitor::new()) }
    }

    /// The endpoint monitor
    pub fn monitor(&self) -> Arc<PerformanceMonitor> {
        self.monitor.clone()
    }

    /// Handle one tool call. Always returns a structured response.
    pub async fn handle(&self, call: ToolCall) -> ToolResponse {
        let started = Instant::now();
        debug!(tool = %call.tool, "tool call");
        let response = match self.dispatch(&call).await {
            Ok(data) => ToolResponse::ok(data),
            Err(e) => ToolResponse::err(&e),
        };
        let status = if response.success {
            200
        } else {
            response.error.as_ref().map(|e| e.code.http_status()).unwrap_or(500)
        };
        self.monitor.track_endpoint(&call.tool, started.elapsed(), status);
        response
    }

    async fn dispatch(&self, call: &ToolCall) -> Result<serde_json::Value> {
        match call.tool.as_str() {
            // Session tools
            "start_browser_session" => {
                let params: StartSessionParams = parse(call)?;
                let mut config = SessionConfig::new(&params.room_name);
                config.initial_url = params.initial_url;
                config.stream_mode = params.stream_mode;
                if let Some(viewport) = params.viewport {
                    config.viewport = viewport;
                }
                if let Some(identity) = params.participant_identity {
                    config.participant_identity = identity;
                }
                self.manager.start_session(config).await?;
                Ok(serde_json::json!({"room_name": params.room_name, "status": "active"}))
            }
            "pause_browser_session" => {
                let params: RoomParams = parse(call)?;
                self.manager.pause_session(&params.room_name).await?;
                Ok(serde_json::json!({"room_name": params.room_name, "status": "paused"}))
            }
            "resume_browser_session" => {
                let params: RoomParams = parse(call)?;
                self.manager.resume_session(&params.room_name).await?;
                Ok(serde_json::json!({"room_name": params.room_name, "status": "active"}))
            }
            "close_browser_session" => {
                let params: RoomParams = parse(call)?;
                self.manager.close_session(&params.room_name).await?;
                Ok(serde_json::json!({"room_name": params.room_name, "status": "closed"}))
            }
            "recover_browser_session" => {
                let params: RoomParams = parse(call)?;
                self.manager.recover_session(&params.room_name).await?;
                Ok(serde_json::json!({"room_name": params.room_name, "status": "active"}))
            }

            // State tools
            "get_browser_context" => {
                let params: RoomParams = parse(call)?;
                let context = self.manager.get_context(&params.room_name).await?;
                Ok(serde_json::to_value(context)?)
            }
            "get_screen_content" => {
                let params: RoomParams = parse(call)?;
                let content = self.manager.get_screen_content(&params.room_name).await?;
                Ok(serde_json::to_value(content)?)
            }
            "find_form_fields" => {
                let params: RoomParams = parse(call)?;
                let fields = self.manager.find_form_fields(&params.room_name).await?;
                Ok(serde_json::to_value(fields)?)
            }

            // Dispatch tool (stream fallback)
            "execute_action" => {
                let params: ExecuteActionParams = parse(call).map_err(|e| {
                    // An unrecognized tag is its own error code; other shape
                    // problems stay InvalidParams.
                    if e.to_string().contains("unknown variant") {
                        let tag = call.arguments.get("action_type").cloned().unwrap_or_default();
                        Error::validation(
                            ErrorCode::UnknownActionType,
                            format!("unknown action type {}", tag),
                        )
                    } else {
                        e
                    }
                })?;
                let result = self
                    .manager
                    .execute_action(&params.room_name, params.action, params.timeout_ms)
                    .await?;
                Ok(serde_json::to_value(result)?)
            }

            // Knowledge tools
            "start_knowledge_exploration" => {
                let params: StartExplorationParams = parse(call)?;
                if params.sources.is_empty() {
                    return Err(Error::invalid_params("at least one source required"));
                }
                let knowledge_id = params
                    .knowledge_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let mut sources = params.sources;
                for source in &mut sources {
                    source.knowledge_id = knowledge_id.clone();
                }
                let job = ExtractionJob::new(&knowledge_id, sources);
                let job_id = job.job_id.clone();
                let workflow = self.workflow.clone();
                tokio::spawn(async move {
                    let _ = workflow.run(job).await;
                });
                Ok(serde_json::json!({"job_id": job_id, "knowledge_id": knowledge_id}))
            }
            "get_exploration_status" => {
                let params: JobParams = parse(call)?;
                let status = self.workflow.jobs().get(&params.job_id).ok_or_else(|| {
                    Error::validation(ErrorCode::NotFound, format!("no job {}", params.job_id))
                })?;
                Ok(serde_json::to_value(status)?)
            }
            "pause_exploration" => {
                let params: JobParams = parse(call)?;
                self.workflow
                    .signal(&params.job_id, crate::capabilities::WorkflowSignal::Pause)
                    .await?;
                Ok(serde_json::json!({"job_id": params.job_id, "signal": "pause"}))
            }
            "resume_exploration" => {
                let params: JobParams = parse(call)?;
                self.workflow
                    .signal(&params.job_id, crate::capabilities::WorkflowSignal::Resume)
                    .await?;
                Ok(serde_json::json!({"job_id": params.job_id, "signal": "resume"}))
            }
            "cancel_exploration" => {
                let params: JobParams = parse(call)?;
                self.workflow
                    .signal(&params.job_id, crate::capabilities::WorkflowSignal::Cancel)
                    .await?;
                Ok(serde_json::json!({"job_id": params.job_id, "signal": "cancel"}))
            }
            "get_knowledge_results" => {
                let params: KnowledgeParams = parse(call)?;
                let slice = self.workflow.store().load_slice(&params.knowledge_id).await?;
                Ok(serde_json::to_value(slice)?)
            }
            "query_knowledge" => {
                let params: QueryKnowledgeParams = parse(call)?;
                self.query_knowledge(params).await
            }

            other => Err(Error::validation(
                ErrorCode::NotFound,
                format!("unknown tool '{}'", other),
            )),
        }
    }

    async fn query_knowledge(&self, params: QueryKnowledgeParams) -> Result<serde_json::Value> {
        let slice = self.workflow.store().load_slice(&params.knowledge_id).await?;
        let index = GraphIndex::build(&slice);

        match params.query_type {
            KnowledgeQueryType::Page => {
                let url = params
                    .url
                    .ok_or_else(|| Error::invalid_params("page query requires url"))?;
                let screen = slice.screens.iter().find(|s| s.matches_url(&url));
                Ok(serde_json::json!({"screen": screen}))
            }
            KnowledgeQueryType::Search => {
                let query = params
                    .query
                    .ok_or_else(|| Error::invalid_params("search query requires query"))?;
                let hits = index.search_screens(&query);
                Ok(serde_json::json!({"screens": hits}))
            }
            KnowledgeQueryType::Links => {
                let screen_id = params
                    .screen_id
                    .ok_or_else(|| Error::invalid_params("links query requires screen_id"))?;
                Ok(serde_json::json!({"neighbors": index.neighbors(&screen_id)}))
            }
            KnowledgeQueryType::SitemapSemantic => {
                let groups: Vec<serde_json::Value> = slice
                    .groups
                    .iter()
                    .map(|g| {
                        serde_json::json!({
                            "group": g.name,
                            "screens": g.screen_ids,
                            "recovery": g.sorted_recovery_edges(),
                        })
                    })
                    .collect();
                Ok(serde_json::json!({"groups": groups}))
            }
            KnowledgeQueryType::SitemapFunctional => {
                let functions: Vec<serde_json::Value> = slice
                    .functions
                    .iter()
                    .map(|f| {
                        serde_json::json!({
                            "function": f.name,
                            "screens": f.screen_ids,
                            "tasks": f.task_ids,
                        })
                    })
                    .collect();
                Ok(serde_json::json!({"functions": functions}))
            }
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(call: &ToolCall) -> Result<T> {
    serde_json::from_value(call.arguments.clone()).map_err(|e| {
        Error::invalid_params(format!("bad arguments for {}: {}", call.tool, e))
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventPublisher;
    use crate::capabilities::{
        LocalWorkflowRuntime, MemoryDocStore, MemoryStreamBus, MockBrowserDriver,
        MockBrowserDriverFactory, MockTextLlm, MockVideoPublisherFactory,
    };
    use crate::config::ServiceConfig;
    use crate::dom::{DomElement, DomSnapshot};
    use crate::ingest::{DocumentationIngester, IngestionRouter, SourceType};
    use crate::knowledge::store::KnowledgeStore;

    fn login_page() -> DomSnapshot {
        DomSnapshot::from_parts(
            "https://example.com/login",
            "Login",
            vec![
                DomElement::new("input").input_type("email").name("email"),
                DomElement::new("input").input_type("password").name("password"),
                DomElement::new("button").text("Sign in"),
            ],
        )
    }

    fn router() -> (ToolRouter, Arc<MockBrowserDriverFactory>) {
        let drivers = Arc::new(MockBrowserDriverFactory::new());
        let bus = Arc::new(MemoryStreamBus::new());
        let manager = SessionManager::builder()
            .driver_factory(drivers.clone())
            .video_factory(Arc::new(MockVideoPublisherFactory::new()))
            .bus(bus.clone())
            .config(ServiceConfig::default())
            .build()
            .unwrap();

        let workflow = Arc::new(
            KnowledgeWorkflow::builder()
                .runtime(Arc::new(LocalWorkflowRuntime::new()))
                .store(Arc::new(KnowledgeStore::new(Arc::new(MemoryDocStore::new()))))
                .router(Arc::new(
                    IngestionRouter::new().register(Arc::new(DocumentationIngester::new())),
                ))
                .llm(Arc::new(MockTextLlm::new()))
                .events(Arc::new(EventPublisher::new(bus)))
                .build()
                .unwrap(),
        );

        (ToolRouter::new(manager, workflow), drivers)
    }

    async fn start_session(router: &ToolRouter, drivers: &MockBrowserDriverFactory, room: &str) {
        drivers.script(Arc::new(MockBrowserDriver::with_page(login_page())));
        let response = router
            .handle(ToolCall::new(
                "start_browser_session",
                serde_json::json!({"room_name": room, "stream_mode": false}),
            ))
            .await;
        assert!(response.success, "{:?}", response.error);
    }

    #[tokio::test]
    async fn test_session_tool_roundtrip() {
        let (router, drivers) = router();
        start_session(&router, &drivers, "demo").await;

        let context = router
            .handle(ToolCall::new("get_browser_context", serde_json::json!({"room_name": "demo"})))
            .await;
        assert!(context.success);
        assert_eq!(context.data.unwrap()["url"], "https://example.com/login");

        let fields = router
            .handle(ToolCall::new("find_form_fields", serde_json::json!({"room_name": "demo"})))
            .await;
        assert!(fields.success);
        let data = fields.data.unwrap();
        assert_eq!(data["username_index"], 0);
        assert_eq!(data["password_index"], 1);

        let closed = router
            .handle(ToolCall::new("close_browser_session", serde_json::json!({"room_name": "demo"})))
            .await;
        assert!(closed.success);
    }

    #[tokio::test]
    async fn test_execute_action_tool() {
        let (router, drivers) = router();
        start_session(&router, &drivers, "demo").await;

        let response = router
            .handle(ToolCall::new(
                "execute_action",
                serde_json::json!({
                    "room_name": "demo",
                    "action_type": "type",
                    "params": {"text": "alice", "index": 0}
                }),
            ))
            .await;
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.data.unwrap()["success"], true);
    }

    #[tokio::test]
    async fn test_unknown_action_type_is_structured_error() {
        let (router, drivers) = router();
        start_session(&router, &drivers, "demo").await;

        let response = router
            .handle(ToolCall::new(
                "execute_action",
                serde_json::json!({
                    "room_name": "demo",
                    "action_type": "teleport",
                    "params": {}
                }),
            ))
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::UnknownActionType);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (router, _) = router();
        let response = router.handle(ToolCall::new("fly_to_moon", serde_json::json!({}))).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_session_not_found_is_structured() {
        let (router, _) = router();
        let response = router
            .handle(ToolCall::new("get_browser_context", serde_json::json!({"room_name": "ghost"})))
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn test_exploration_tools_end_to_end() {
        let (router, _) = router();
        let response = router
            .handle(ToolCall::new(
                "start_knowledge_exploration",
                serde_json::json!({
                    "knowledge_id": "k1",
                    "sources": [{
                        "source_id": "s1",
                        "knowledge_id": "k1",
                        "source_type": "documentation",
                        "location": "inline://doc",
                        "inline_text": "# Reports\n\nThe Reports page lists exports."
                    }]
                }),
            ))
            .await;
        assert!(response.success, "{:?}", response.error);
        let job_id = response.data.unwrap()["job_id"].as_str().unwrap().to_string();

        // Poll until the background run finishes.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let status = router
                .handle(ToolCall::new(
                    "get_exploration_status",
                    serde_json::json!({"job_id": job_id}),
                ))
                .await;
            assert!(status.success);
            let state = status.data.unwrap()["state"].as_str().unwrap().to_string();
            if state == "completed" {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job stuck in {}", state);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let results = router
            .handle(ToolCall::new(
                "get_knowledge_results",
                serde_json::json!({"knowledge_id": "k1"}),
            ))
            .await;
        assert!(results.success);
        let slice = results.data.unwrap();
        assert!(!slice["screens"].as_array().unwrap().is_empty());

        let search = router
            .handle(ToolCall::new(
                "query_knowledge",
                serde_json::json!({
                    "knowledge_id": "k1",
                    "query_type": "search",
                    "query": "reports"
                }),
            ))
            .await;
        assert!(search.success);
        assert!(!search.data.unwrap()["screens"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_tracks_tools() {
        let (router, _) = router();
        router.handle(ToolCall::new("fly_to_moon", serde_json::json!({}))).await;
        let stats = router.monitor().endpoint_stats("fly_to_moon").unwrap();
        assert_eq!(stats.call_count, 1);
        assert_eq!(stats.error_count, 1);
    }
}
