//! Business-level extraction
//!
//! Business functions, user flows, workflows, and features come from the
//! text-LLM seam with structured-output validation: the model must return a
//! JSON document matching [`BusinessExtraction`], and anything else fails
//! the activity with `SchemaValidationFailed`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::capabilities::TextLlm;
use crate::error::{Error, ErrorCode, Result};
use crate::ingest::ContentChunk;
use crate::knowledge::{
    BusinessFeature, BusinessFunction, Provenance, UserFlow, WorkflowEntity,
};

use super::{new_id, ExtractionContext};

const SYSTEM_PROMPT: &str = "You extract business-level structure from product documentation. \
Respond with a single JSON object matching the requested schema and nothing else.";

/// Structured output contract for the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusinessExtraction {
    #[serde(default)]
    pub functions: Vec<ExtractedFunction>,
    #[serde(default)]
    pub flows: Vec<ExtractedFlow>,
    #[serde(default)]
    pub workflows: Vec<ExtractedWorkflow>,
    #[serde(default)]
    pub features: Vec<ExtractedFeature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFunction {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub screens_mentioned: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFlow {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedWorkflow {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFeature {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub functions: Vec<String>,
}

/// Output of the business extraction activity.
#[derive(Debug, Clone, Default)]
pub struct BusinessEntities {
    pub functions: Vec<BusinessFunction>,
    pub flows: Vec<UserFlow>,
    pub workflows: Vec<WorkflowEntity>,
    pub features: Vec<BusinessFeature>,
}

/// LLM-backed extractor for higher-level entities.
pub struct BusinessExtractor {
    llm: Arc<dyn TextLlm>,
}

impl BusinessExtractor {
    pub fn new(llm: Arc<dyn TextLlm>) -> Self {
        Self { llm }
    }

    /// Extract business entities from chunks.
    pub async fn extract(
        &self,
        chunks: &[ContentChunk],
        ctx: &ExtractionContext,
    ) -> Result<BusinessEntities> {
        let mut entities = BusinessEntities::default();
        for chunk in chunks {
            let prompt = build_prompt(&chunk.text);
            let raw = self.llm.complete(SYSTEM_PROMPT, &prompt).await?;
            let parsed = parse_extraction(&raw)?;
            merge(&mut entities, parsed, chunk, ctx);
        }
        debug!(
            functions = entities.functions.len(),
            flows = entities.flows.len(),
            workflows = entities.workflows.len(),
            features = entities.features.len(),
            "business entities extracted"
        );
        Ok(entities)
    }
}

fn build_prompt(text: &str) -> String {
    format!(
        "Extract business functions, user flows, workflows, and features from the text below. \
Schema: {{\"functions\":[{{\"name\",\"description\",\"screens_mentioned\":[]}}],\
\"flows\":[{{\"name\",\"steps\":[]}}],\"workflows\":[{{\"name\",\"steps\":[]}}],\
\"features\":[{{\"name\",\"description\",\"functions\":[]}}]}}\n\nTEXT:\n{}",
        text
    )
}

/// Parse and validate the model's structured output.
pub fn parse_extraction(raw: &str) -> Result<BusinessExtraction> {
    // Tolerate code fences around the JSON body, nothing more.
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let parsed: BusinessExtraction = serde_json::from_str(trimmed).map_err(|e| {
        Error::workflow(
            ErrorCode::SchemaValidationFailed,
            format!("business extraction output is not valid JSON: {}", e),
        )
    })?;
    for function in &parsed.functions {
        if function.name.trim().is_empty() {
            return Err(Error::workflow(
                ErrorCode::SchemaValidationFailed,
                "business function with empty name",
            ));
        }
    }
    Ok(parsed)
}

fn merge(
    entities: &mut BusinessEntities,
    parsed: BusinessExtraction,
    chunk: &ContentChunk,
    ctx: &ExtractionContext,
) {
    let provenance = || Provenance::new(format!("llm:chunk:{}", chunk.chunk_id), 0.7);

    for function in parsed.functions {
        if entities.functions.iter().any(|f| f.name.eq_ignore_ascii_case(&function.name)) {
            continue;
        }
        entities.functions.push(BusinessFunction {
            function_id: new_id("function"),
            knowledge_id: ctx.knowledge_id.clone(),
            name: function.name,
            description: function.description,
            screens_mentioned: function.screens_mentioned,
            screen_ids: Vec::new(),
            task_ids: Vec::new(),
            provenance: provenance(),
        });
    }
    for flow in parsed.flows {
        entities.flows.push(UserFlow {
            flow_id: new_id("flow"),
            knowledge_id: ctx.knowledge_id.clone(),
            name: flow.name,
            step_descriptions: flow.steps,
            screen_ids: Vec::new(),
            action_ids: Vec::new(),
            provenance: provenance(),
        });
    }
    for workflow in parsed.workflows {
        entities.workflows.push(WorkflowEntity {
            workflow_id: new_id("workflow"),
            knowledge_id: ctx.knowledge_id.clone(),
            name: workflow.name,
            step_refs: workflow.steps,
            screen_ids: Vec::new(),
            task_ids: Vec::new(),
            action_ids: Vec::new(),
            provenance: provenance(),
        });
    }
    for feature in parsed.features {
        let function_ids = entities
            .functions
            .iter()
            .filter(|f| feature.functions.iter().any(|n| n.eq_ignore_ascii_case(&f.name)))
            .map(|f| f.function_id.clone())
            .collect();
        entities.features.push(BusinessFeature {
            feature_id: new_id("feature"),
            knowledge_id: ctx.knowledge_id.clone(),
            name: feature.name,
            description: feature.description,
            function_ids,
            provenance: provenance(),
        });
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MockTextLlm;
    use crate::ingest::SourceType;

    fn chunk(text: &str) -> ContentChunk {
        ContentChunk::new("k1", "src-1", SourceType::Documentation, 0, text)
    }

    fn ctx() -> ExtractionContext {
        ExtractionContext::new("k1")
    }

    #[tokio::test]
    async fn test_structured_output_parsed() {
        let llm = Arc::new(MockTextLlm::new());
        llm.respond(
            r#"{"functions":[{"name":"Billing","description":"Invoices","screens_mentioned":["Invoice History"]}],
                "workflows":[{"name":"Monthly close","steps":["Open invoices","Export list"]}],
                "features":[{"name":"Payments","description":"","functions":["Billing"]}]}"#,
        );

        let extractor = BusinessExtractor::new(llm);
        let entities = extractor.extract(&[chunk("billing docs")], &ctx()).await.unwrap();

        assert_eq!(entities.functions.len(), 1);
        assert_eq!(entities.functions[0].screens_mentioned, vec!["Invoice History"]);
        assert_eq!(entities.workflows.len(), 1);
        assert_eq!(entities.features.len(), 1);
        // The feature resolves its function by name.
        assert_eq!(entities.features[0].function_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_code_fenced_output_tolerated() {
        let llm = Arc::new(MockTextLlm::new());
        llm.respond("```json\n{\"functions\":[{\"name\":\"Search\"}]}\n```");

        let extractor = BusinessExtractor::new(llm);
        let entities = extractor.extract(&[chunk("docs")], &ctx()).await.unwrap();
        assert_eq!(entities.functions.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_output_fails_schema_validation() {
        let llm = Arc::new(MockTextLlm::new());
        llm.respond("The functions are billing and search.");

        let extractor = BusinessExtractor::new(llm);
        let err = extractor.extract(&[chunk("docs")], &ctx()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaValidationFailed);
    }

    #[tokio::test]
    async fn test_empty_function_name_rejected() {
        let llm = Arc::new(MockTextLlm::new());
        llm.respond(r#"{"functions":[{"name":"  "}]}"#);

        let extractor = BusinessExtractor::new(llm);
        let err = extractor.extract(&[chunk("docs")], &ctx()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaValidationFailed);
    }

    #[tokio::test]
    async fn test_duplicate_functions_merged() {
        let llm = Arc::new(MockTextLlm::new().with_default(r#"{"functions":[{"name":"Billing"}]}"#));
        let extractor = BusinessExtractor::new(llm);
        let entities = extractor
            .extract(&[chunk("doc one"), chunk("doc two")], &ctx())
            .await
            .unwrap();
        assert_eq!(entities.functions.len(), 1);
    }
}
