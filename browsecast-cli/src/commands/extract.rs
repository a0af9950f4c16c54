//! Extract command: run a knowledge extraction job from a YAML job file.

use anyhow::{Context, Result};
use browsecast::config::ServiceConfig;
use browsecast::knowledge::graph::GraphIndex;
use browsecast::workflow::ExtractionJob;

use super::local_stack;

pub async fn run(file: String, verify: bool, search: Option<String>) -> Result<()> {
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("failed to read job file {}", file))?;
    let job: ExtractionJob =
        serde_yaml::from_str(&content).with_context(|| format!("invalid job file {}", file))?;

    let mut config = ServiceConfig::default();
    config.workflow.verification_enabled = verify;
    let stack = local_stack(config)?;

    let knowledge_id = job.knowledge_id.clone();
    let report = stack.workflow.run(job).await?;

    println!("job:        {}", report.job_id);
    println!("knowledge:  {}", report.knowledge_id);
    println!("chunks:     {}", report.chunk_count);
    println!("entities:   {}", report.entity_count);
    println!("replaced:   {}", report.replaced_entities);
    println!("phases:     {}", report.completed_phases.join(", "));
    if !report.issues.is_empty() {
        println!("--- validation warnings ---");
        for issue in &report.issues {
            println!("  [{}] {}", issue.code, issue.message);
        }
    }
    if !report.discrepancies.is_empty() {
        println!("--- verification discrepancies ---");
        for discrepancy in &report.discrepancies {
            println!(
                "  {}: expected {}, observed {}",
                discrepancy.action_id, discrepancy.expected, discrepancy.observed
            );
        }
    }

    if let Some(query) = search {
        let slice = stack.workflow.store().load_slice(&knowledge_id).await?;
        let index = GraphIndex::build(&slice);
        println!("--- screens matching '{}' ---", query);
        for screen in index.search_screens(&query) {
            println!("  {}  {}", screen.screen_id, screen.name);
        }
    }
    Ok(())
}
