//! CLI command implementations

pub mod extract;
pub mod serve;
pub mod session;

use std::sync::Arc;

use anyhow::Result;
use browsecast::bus::EventPublisher;
use browsecast::capabilities::{
    LocalWorkflowRuntime, MemoryDocStore, MemoryStreamBus, MockBrowserDriverFactory,
    MockTextLlm, MockVideoPublisherFactory,
};
use browsecast::config::ServiceConfig;
use browsecast::ingest::{DocumentationIngester, IngestionRouter, VideoIngester, WebsiteIngester};
use browsecast::knowledge::store::KnowledgeStore;
use browsecast::session::SessionManager;
use browsecast::workflow::KnowledgeWorkflow;

/// Everything local mode wires together: in-memory capabilities end to end.
/// A production deployment swaps each factory for its real implementation.
pub struct LocalStack {
    pub manager: Arc<SessionManager>,
    pub workflow: Arc<KnowledgeWorkflow>,
    pub drivers: Arc<MockBrowserDriverFactory>,
}

/// Build the local capability stack.
pub fn local_stack(config: ServiceConfig) -> Result<LocalStack> {
    let drivers = Arc::new(MockBrowserDriverFactory::new());
    let bus = Arc::new(MemoryStreamBus::new());

    let manager = SessionManager::builder()
        .driver_factory(drivers.clone())
        .video_factory(Arc::new(MockVideoPublisherFactory::new()))
        .bus(bus.clone())
        .config(config.clone())
        .build()?;

    let router = IngestionRouter::new()
        .register(Arc::new(DocumentationIngester::new()))
        .register(Arc::new(WebsiteIngester::new(drivers.clone())))
        .register(Arc::new(VideoIngester::new(Arc::new(
            browsecast::capabilities::MockTranscriber::default(),
        ))));

    let workflow = Arc::new(
        KnowledgeWorkflow::builder()
            .runtime(Arc::new(LocalWorkflowRuntime::new()))
            .store(Arc::new(KnowledgeStore::new(Arc::new(MemoryDocStore::new()))))
            .router(Arc::new(router))
            .llm(Arc::new(MockTextLlm::new()))
            .events(Arc::new(EventPublisher::new(bus)))
            .drivers(drivers.clone())
            .config(config.workflow)
            .build()?,
    );

    Ok(LocalStack { manager, workflow, drivers })
}
