//! Serve command: the agent-facing tool loop over stdio.
//!
//! Reads one JSON tool call per line from stdin and writes one JSON response
//! per line to stdout, which is enough to mount the service behind any
//! MCP-style transport.

use anyhow::Result;
use browsecast::config::ServiceConfig;
use browsecast::rpc::{ToolCall, ToolResponse, ToolRouter};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use super::local_stack;

pub async fn run(config_path: Option<String>) -> Result<()> {
    let config = match config_path {
        Some(path) => ServiceConfig::from_path(path)?,
        None => ServiceConfig::default(),
    };
    let stack = local_stack(config)?;
    let router = ToolRouter::new(stack.manager.clone(), stack.workflow.clone());

    info!("browsecast serving tool calls on stdio");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<ToolCall>(trimmed) {
                    Ok(call) => router.handle(call).await,
                    Err(e) => ToolResponse::err(&browsecast::Error::invalid_params(format!(
                        "unparseable tool call: {}",
                        e
                    ))),
                };
                let mut out = serde_json::to_vec(&response)?;
                out.push(b'\n');
                stdout.write_all(&out).await?;
                stdout.flush().await?;
            }
        }
    }

    // Shutdown summary from the endpoint monitor.
    for stats in router.monitor().all_endpoints() {
        info!(
            endpoint = %stats.endpoint,
            calls = stats.call_count,
            errors = stats.error_count,
            "endpoint summary"
        );
    }
    for room in stack.manager.rooms() {
        let _ = stack.manager.close_session(&room).await;
    }
    Ok(())
}
