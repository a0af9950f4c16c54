//! Browsecast CLI - Command-line interface for Browsecast
//!
//! # Commands
//!
//! - `browsecast serve` - Run the tool-call loop over stdio (local mode)
//! - `browsecast session <url>` - One-shot session inspection
//! - `browsecast extract <file>` - Run an extraction job from a YAML file
//! - `browsecast --version` - Show version

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Browsecast - live browser session orchestration for agents
#[derive(Parser)]
#[command(name = "browsecast")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Live browser session orchestration for voice and LLM agents")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent-facing tool loop over stdio
    Serve {
        /// Path to a TOML service config
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Start a one-shot session against a URL and print its context
    Session {
        /// Initial URL
        url: String,

        /// Room name
        #[arg(short, long, default_value = "local")]
        room: String,
    },

    /// Run an extraction job from a YAML job file
    Extract {
        /// Path to the YAML job file
        file: String,

        /// Enable the browser verification phase
        #[arg(long)]
        verify: bool,

        /// Search the extracted screens after the run
        #[arg(long)]
        search: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    match cli.command {
        Commands::Serve { config } => commands::serve::run(config).await,
        Commands::Session { url, room } => commands::session::run(url, room).await,
        Commands::Extract { file, verify, search } => {
            commands::extract::run(file, verify, search).await
        }
    }
}
