//! Source ingestion
//!
//! Turns heterogeneous sources into [`ContentChunk`]s for the extractors:
//! - `DocumentationIngester` - Inline or fetched documentation text
//! - `WebsiteIngester` - Bounded same-host crawl through a browser driver
//! - `VideoIngester` - Transcription plus optional frame captions
//! - `IngestionRouter` - Picks the implementation by source tag
//!
//! Chunks respect a token budget at semantic boundaries and carry a
//! `content_hash` so re-ingestion deduplicates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capabilities::{BrowserDriverFactory, Transcriber, VisionLlm};
use crate::config::ViewportConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::now_ms;

/// Token budget per chunk.
pub const MAX_CHUNK_TOKENS: usize = 2000;

/// Presigned URLs are valid for at most one hour.
pub const MAX_PRESIGNED_VALIDITY_MS: u64 = 3600 * 1000;

// =============================================================================
// SOURCES & CHUNKS
// =============================================================================

/// Kind of source being ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Documentation,
    Website,
    Video,
}

/// One source to ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSource {
    pub source_id: String,
    pub knowledge_id: String,
    pub source_type: SourceType,
    /// URL or path of the source
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Inline text, used instead of fetching when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_text: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl IngestSource {
    /// Create a source
    pub fn new(
        knowledge_id: impl Into<String>,
        source_type: SourceType,
        location: impl Into<String>,
    ) -> Self {
        Self {
            source_id: uuid::Uuid::new_v4().to_string(),
            knowledge_id: knowledge_id.into(),
            source_type,
            location: location.into(),
            title: None,
            inline_text: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach inline text
    pub fn inline_text(mut self, text: impl Into<String>) -> Self {
        self.inline_text = Some(text.into());
        self
    }

    /// Set the title
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// A chunk of source content within the token budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentChunk {
    pub chunk_id: String,
    pub knowledge_id: String,
    pub source_id: String,
    pub source_type: SourceType,
    /// Chunk position within its source
    pub index: usize,
    pub text: String,
    pub token_estimate: usize,
    /// SHA-256 hex over the chunk text, for dedup
    pub content_hash: String,
    /// Page URL the chunk came from, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
}

impl ContentChunk {
    /// Create a chunk, computing token estimate and content hash
    pub fn new(
        knowledge_id: impl Into<String>,
        source_id: impl Into<String>,
        source_type: SourceType,
        index: usize,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            chunk_id: uuid::Uuid::new_v4().to_string(),
            knowledge_id: knowledge_id.into(),
            source_id: source_id.into(),
            source_type,
            index,
            token_estimate: estimate_tokens(&text),
            content_hash: hash_text(&text),
            text,
            page_url: None,
        }
    }

    /// Set the originating page URL
    pub fn page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }
}

/// Rough token estimate: one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// SHA-256 hex over text.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Split text into chunks within the token budget, preferring paragraph and
/// heading boundaries. A single oversized paragraph is split hard.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<String> {
    let mut paragraphs: Vec<String> = Vec::new();
    for block in text.split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        // Headings start their own paragraph.
        for line_group in block.split_inclusive('\n') {
            if line_group.trim_start().starts_with('#') {
                paragraphs.push(line_group.trim().to_string());
            } else if let Some(last) = paragraphs.last_mut() {
                if last.starts_with('#') {
                    paragraphs.push(line_group.trim().to_string());
                } else {
                    last.push('\n');
                    last.push_str(line_group.trim());
                }
            } else {
                paragraphs.push(line_group.trim().to_string());
            }
        }
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    for paragraph in paragraphs {
        if estimate_tokens(&paragraph) > max_tokens {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            // Hard split an oversized paragraph on char boundaries.
            let chars: Vec<char> = paragraph.chars().collect();
            for piece in chars.chunks(max_tokens * 4) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        let candidate_tokens = estimate_tokens(&current) + estimate_tokens(&paragraph);
        if !current.is_empty() && candidate_tokens > max_tokens {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(&paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// =============================================================================
// INGESTER TRAIT & IMPLEMENTATIONS
// =============================================================================

/// One ingestion strategy per source type.
#[async_trait]
pub trait Ingester: Send + Sync {
    fn source_type(&self) -> SourceType;
    async fn ingest(&self, source: &IngestSource) -> Result<Vec<ContentChunk>>;
}

/// Documentation: inline text or a fetched document, chunked at semantic
/// boundaries.
pub struct DocumentationIngester {
    http: reqwest::Client,
}

impl Default for DocumentationIngester {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentationIngester {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }
}

#[async_trait]
impl Ingester for DocumentationIngester {
    fn source_type(&self) -> SourceType {
        SourceType::Documentation
    }

    async fn ingest(&self, source: &IngestSource) -> Result<Vec<ContentChunk>> {
        let text = match &source.inline_text {
            Some(text) => text.clone(),
            None => {
                debug!(location = %source.location, "fetching documentation source");
                let response = self.http.get(&source.location).send().await?;
                if response.status().as_u16() == 404 {
                    return Err(Error::validation(
                        ErrorCode::NotFound,
                        format!("document not found: {}", source.location),
                    ));
                }
                response.text().await?
            }
        };

        let chunks = chunk_text(&text, MAX_CHUNK_TOKENS)
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                ContentChunk::new(&source.knowledge_id, &source.source_id, SourceType::Documentation, i, text)
            })
            .collect();
        Ok(chunks)
    }
}

/// Website: bounded breadth-first crawl of same-host pages through the
/// browser driver, one chunk set per page.
pub struct WebsiteIngester {
    drivers: Arc<dyn BrowserDriverFactory>,
    max_pages: usize,
}

impl WebsiteIngester {
    pub fn new(drivers: Arc<dyn BrowserDriverFactory>) -> Self {
        Self { drivers, max_pages: 10 }
    }

    /// Bound the crawl
    pub fn max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }
}

fn url_host(url: &str) -> String {
    url.split("//")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("")
        .to_string()
}

#[async_trait]
impl Ingester for WebsiteIngester {
    fn source_type(&self) -> SourceType {
        SourceType::Website
    }

    async fn ingest(&self, source: &IngestSource) -> Result<Vec<ContentChunk>> {
        let driver = self.drivers.create(&ViewportConfig::default()).await?;
        let root_host = url_host(&source.location);

        let mut queue: VecDeque<String> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        queue.push_back(source.location.clone());

        let mut chunks = Vec::new();
        let mut index = 0;
        while let Some(url) = queue.pop_front() {
            if visited.len() >= self.max_pages || !visited.insert(url.clone()) {
                continue;
            }
            if let Err(e) = driver.navigate(&url, false).await {
                warn!(url = %url, error = %e, "crawl navigation failed, skipping page");
                continue;
            }
            let snapshot = driver.snapshot().await?;

            let mut page_text = format!("# {}\n\n", snapshot.title);
            page_text.push_str(&snapshot.visible_text());
            for text in chunk_text(&page_text, MAX_CHUNK_TOKENS) {
                chunks.push(
                    ContentChunk::new(
                        &source.knowledge_id,
                        &source.source_id,
                        SourceType::Website,
                        index,
                        text,
                    )
                    .page_url(snapshot.url.clone()),
                );
                index += 1;
            }

            for element in &snapshot.elements {
                if let Some(href) = &element.attributes.href {
                    if url_host(href) == root_host && !visited.contains(href) {
                        queue.push_back(href.clone());
                    }
                }
            }
        }
        let _ = driver.close().await;
        info!(pages = visited.len(), chunks = chunks.len(), "website crawl complete");
        Ok(chunks)
    }
}

/// Video: transcript segments (plus optional frame captions) chunked along
/// time boundaries.
pub struct VideoIngester {
    transcriber: Arc<dyn Transcriber>,
    vision: Option<Arc<dyn VisionLlm>>,
}

impl VideoIngester {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber, vision: None }
    }

    /// Attach a vision model for frame captions
    pub fn with_vision(mut self, vision: Arc<dyn VisionLlm>) -> Self {
        self.vision = Some(vision);
        self
    }
}

#[async_trait]
impl Ingester for VideoIngester {
    fn source_type(&self) -> SourceType {
        SourceType::Video
    }

    async fn ingest(&self, source: &IngestSource) -> Result<Vec<ContentChunk>> {
        let transcript = self.transcriber.transcribe(&source.location).await?;
        let mut text = String::new();
        for segment in &transcript.segments {
            text.push_str(&format!("[{}s] {}\n", segment.start_ms / 1000, segment.text));
        }
        if let Some(vision) = &self.vision {
            // Caption a representative frame; the seam owns frame extraction.
            match vision.caption(&[], "Describe the screen shown in this recording").await {
                Ok(caption) => text.push_str(&format!("\n[frame] {}\n", caption)),
                Err(e) => warn!(error = %e, "frame captioning failed, transcript only"),
            }
        }

        Ok(chunk_text(&text, MAX_CHUNK_TOKENS)
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                ContentChunk::new(&source.knowledge_id, &source.source_id, SourceType::Video, i, text)
            })
            .collect())
    }
}

/// Routes a source to the ingester registered for its type.
#[derive(Default)]
pub struct IngestionRouter {
    ingesters: Vec<Arc<dyn Ingester>>,
}

impl IngestionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an ingester
    pub fn register(mut self, ingester: Arc<dyn Ingester>) -> Self {
        self.ingesters.push(ingester);
        self
    }

    /// Ingest a source through the matching implementation.
    pub async fn ingest(&self, source: &IngestSource) -> Result<Vec<ContentChunk>> {
        let ingester = self
            .ingesters
            .iter()
            .find(|i| i.source_type() == source.source_type)
            .ok_or_else(|| {
                Error::invalid_params(format!("no ingester for {:?}", source.source_type))
            })?;
        ingester.ingest(source).await
    }
}

// =============================================================================
// PRESIGNED UPLOADS
// =============================================================================

/// A presigned object reference supplied by the upload endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignedReference {
    pub url: String,
    pub bucket: String,
    pub key: String,
    /// Expiry in ms since epoch
    pub expires_at_ms: u64,
}

/// Metadata accompanying an uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Validate a presigned reference: not expired, and within the one-hour
/// validity window.
pub fn validate_presigned(reference: &PresignedReference) -> Result<()> {
    let now = now_ms();
    if reference.expires_at_ms <= now {
        return Err(Error::validation(
            ErrorCode::PresignedUrlExpired,
            format!("presigned URL for {} expired", reference.key),
        ));
    }
    if reference.expires_at_ms - now > MAX_PRESIGNED_VALIDITY_MS {
        return Err(Error::invalid_params(
            "presigned URL validity exceeds the one-hour maximum",
        ));
    }
    Ok(())
}

/// Downloads presigned uploads into documentation sources.
pub struct UploadFetcher {
    http: reqwest::Client,
}

impl Default for UploadFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadFetcher {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// Validate and download one presigned upload, producing a documentation
    /// source carrying the file body inline.
    pub async fn fetch(
        &self,
        knowledge_id: &str,
        reference: &PresignedReference,
        metadata: &FileMetadata,
    ) -> Result<IngestSource> {
        validate_presigned(reference)?;

        let response = self.http.get(&reference.url).send().await.map_err(|e| {
            Error::permanent(ErrorCode::FileUploadFailed, format!("download failed: {}", e))
        })?;
        match response.status().as_u16() {
            404 => {
                return Err(Error::validation(
                    ErrorCode::NotFound,
                    format!("object {} missing from {}", reference.key, reference.bucket),
                ))
            }
            code if code >= 400 => {
                return Err(Error::permanent(
                    ErrorCode::FileUploadFailed,
                    format!("upstream download returned {}", code),
                ))
            }
            _ => {}
        }
        let body = response.text().await.map_err(|e| {
            Error::permanent(ErrorCode::FileUploadFailed, format!("download read failed: {}", e))
        })?;

        Ok(
            IngestSource::new(knowledge_id, SourceType::Documentation, reference.url.clone())
                .title(metadata.filename.clone())
                .inline_text(body),
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        MockBrowserDriver, MockBrowserDriverFactory, MockTranscriber, Transcript,
        TranscriptSegment,
    };
    use crate::dom::{DomElement, DomSnapshot};

    #[test]
    fn test_chunk_text_respects_budget() {
        let paragraph = "word ".repeat(100);
        let text = vec![paragraph; 20].join("\n\n");
        let chunks = chunk_text(&text, 300);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(estimate_tokens(chunk) <= 300);
        }
    }

    #[test]
    fn test_chunk_text_splits_on_headings() {
        let text = "# Intro\nwelcome\n\n# Setup\ninstall things";
        let chunks = chunk_text(text, 2000);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("# Intro"));
        assert!(chunks[0].contains("# Setup"));
    }

    #[test]
    fn test_chunk_hash_dedup_key() {
        let a = ContentChunk::new("k1", "s1", SourceType::Documentation, 0, "same text");
        let b = ContentChunk::new("k1", "s2", SourceType::Documentation, 3, "same text");
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.chunk_id, b.chunk_id);
    }

    #[tokio::test]
    async fn test_documentation_ingester_inline() {
        let ingester = DocumentationIngester::new();
        let source = IngestSource::new("k1", SourceType::Documentation, "inline://guide")
            .inline_text("# Guide\n\nDo the thing.\n\nThen the other thing.");
        let chunks = ingester.ingest(&source).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].knowledge_id, "k1");
        assert_eq!(chunks[0].source_type, SourceType::Documentation);
    }

    #[tokio::test]
    async fn test_website_ingester_bounded_crawl() {
        let factory = Arc::new(MockBrowserDriverFactory::new());
        let home = DomSnapshot::from_parts(
            "https://example.com",
            "Home",
            vec![
                DomElement::new("h1").text("Welcome"),
                DomElement::new("a").text("About").href("https://example.com/about"),
            ],
        );
        let driver = Arc::new(MockBrowserDriver::with_page(home));
        factory.script(driver);

        let ingester = WebsiteIngester::new(factory).max_pages(2);
        let source = IngestSource::new("k1", SourceType::Website, "https://example.com");
        let chunks = ingester.ingest(&source).await.unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks[0].page_url.is_some());
        assert!(chunks[0].text.contains("Welcome"));
    }

    #[tokio::test]
    async fn test_video_ingester_transcript_chunks() {
        let transcriber = Arc::new(MockTranscriber::new(Transcript {
            segments: vec![
                TranscriptSegment { start_ms: 0, end_ms: 4000, text: "Open the dashboard".into() },
                TranscriptSegment { start_ms: 4000, end_ms: 9000, text: "Click settings".into() },
            ],
        }));
        let ingester = VideoIngester::new(transcriber);
        let source = IngestSource::new("k1", SourceType::Video, "https://example.com/demo.mp4");
        let chunks = ingester.ingest(&source).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("Open the dashboard"));
        assert!(chunks[0].text.contains("[4s]"));
    }

    #[tokio::test]
    async fn test_router_dispatch_by_type() {
        let router = IngestionRouter::new().register(Arc::new(DocumentationIngester::new()));
        let doc = IngestSource::new("k1", SourceType::Documentation, "inline://x").inline_text("hi");
        assert!(router.ingest(&doc).await.is_ok());

        let video = IngestSource::new("k1", SourceType::Video, "v.mp4");
        assert!(router.ingest(&video).await.is_err());
    }

    #[test]
    fn test_presigned_validation() {
        let fresh = PresignedReference {
            url: "https://bucket.s3/x".into(),
            bucket: "bucket".into(),
            key: "x".into(),
            expires_at_ms: now_ms() + 60_000,
        };
        assert!(validate_presigned(&fresh).is_ok());

        let expired = PresignedReference { expires_at_ms: now_ms() - 1, ..fresh.clone() };
        let err = validate_presigned(&expired).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PresignedUrlExpired);
        assert_eq!(err.http_status(), 410);

        let too_long =
            PresignedReference { expires_at_ms: now_ms() + 2 * MAX_PRESIGNED_VALIDITY_MS, ..fresh };
        assert!(validate_presigned(&too_long).is_err());
    }
}
