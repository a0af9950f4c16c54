//! Configuration types for Browsecast
//!
//! This module provides configuration structs for the session, stream, and
//! workflow tiers. Follows the XConfig naming convention.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Viewport configuration for a browser session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportConfig {
    /// Width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Published video frame rate
    #[serde(default = "default_fps")]
    pub fps: u32,
}

fn default_width() -> u32 { 1280 }
fn default_height() -> u32 { 720 }
fn default_fps() -> u32 { 15 }

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
        }
    }
}

impl ViewportConfig {
    /// Create a viewport config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set dimensions
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set frame rate
    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Room name keying the session
    pub room_name: String,

    /// Participant identity published to the video room
    #[serde(default = "default_identity")]
    pub participant_identity: String,

    /// Viewport and frame rate
    #[serde(default)]
    pub viewport: ViewportConfig,

    /// Initial URL to navigate to
    #[serde(default)]
    pub initial_url: Option<String>,

    /// Whether the per-session command stream consumer is started
    #[serde(default = "default_true")]
    pub stream_mode: bool,

    /// Default action timeout in milliseconds
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
}

fn default_identity() -> String { "browsecast-agent".to_string() }
fn default_true() -> bool { true }
fn default_action_timeout_ms() -> u64 { 30_000 }

impl SessionConfig {
    /// Create a session config for a room
    pub fn new(room_name: impl Into<String>) -> Self {
        Self {
            room_name: room_name.into(),
            participant_identity: default_identity(),
            viewport: ViewportConfig::default(),
            initial_url: None,
            stream_mode: true,
            action_timeout_ms: default_action_timeout_ms(),
        }
    }

    /// Set the initial URL
    pub fn initial_url(mut self, url: impl Into<String>) -> Self {
        self.initial_url = Some(url.into());
        self
    }

    /// Set the participant identity
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.participant_identity = identity.into();
        self
    }

    /// Set the viewport
    pub fn viewport(mut self, viewport: ViewportConfig) -> Self {
        self.viewport = viewport;
        self
    }

    /// Disable the stream consumer (RPC-only session)
    pub fn no_stream(mut self) -> Self {
        self.stream_mode = false;
        self
    }
}

/// Stream transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Consumer group for command streams
    #[serde(default = "default_command_group")]
    pub command_group: String,

    /// Consumer group for state streams
    #[serde(default = "default_state_group")]
    pub state_group: String,

    /// Max stream length before trimming
    #[serde(default = "default_max_len")]
    pub max_len: usize,

    /// Idle TTL in seconds after last activity
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,

    /// Blocking read timeout in milliseconds
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    /// Dedup cache TTL in seconds
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,

    /// Idle time before a pending message may be claimed, in seconds
    #[serde(default = "default_claim_idle_secs")]
    pub claim_idle_secs: u64,
}

fn default_command_group() -> String { "browser_agent_cluster".to_string() }
fn default_state_group() -> String { "voice_agent_cluster".to_string() }
fn default_max_len() -> usize { 10_000 }
fn default_idle_ttl_secs() -> u64 { 3600 }
fn default_block_ms() -> u64 { 1000 }
fn default_dedup_ttl_secs() -> u64 { 300 }
fn default_claim_idle_secs() -> u64 { 60 }

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            command_group: default_command_group(),
            state_group: default_state_group(),
            max_len: default_max_len(),
            idle_ttl_secs: default_idle_ttl_secs(),
            block_ms: default_block_ms(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            claim_idle_secs: default_claim_idle_secs(),
        }
    }
}

impl StreamConfig {
    /// Create a stream config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the max stream length
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Set the dedup TTL
    pub fn dedup_ttl_secs(mut self, secs: u64) -> Self {
        self.dedup_ttl_secs = secs;
        self
    }
}

/// Retry policy for transient failures
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Multiplier per attempt
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,

    /// Maximum attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_backoff_ms() -> u64 { 1000 }
fn default_max_backoff_ms() -> u64 { 60_000 }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_max_attempts() -> u32 { 5 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            factor: default_backoff_factor(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryConfig {
    /// Backoff duration for a zero-based attempt number, capped.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let raw = self.initial_backoff_ms as f64 * self.factor.powi(attempt as i32);
        (raw as u64).min(self.max_backoff_ms)
    }
}

/// Knowledge workflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Overall execution bound in seconds
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,

    /// Heartbeat interval while an activity processes items
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,

    /// Heartbeat timeout before the runtime considers the worker dead
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// Checkpoint cadence in items
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    /// Minimum extraction confidence kept
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Whether the browser verification phase runs
    #[serde(default)]
    pub verification_enabled: bool,

    /// Retry policy for activities
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_execution_timeout_secs() -> u64 { 86_400 }
fn default_heartbeat_secs() -> u64 { 30 }
fn default_heartbeat_timeout_secs() -> u64 { 90 }
fn default_checkpoint_every() -> usize { 100 }
fn default_min_confidence() -> f64 { 0.3 }

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: default_execution_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            checkpoint_every: default_checkpoint_every(),
            min_confidence: default_min_confidence(),
            verification_enabled: false,
            retry: RetryConfig::default(),
        }
    }
}

impl WorkflowConfig {
    /// Create a workflow config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the browser verification phase
    pub fn with_verification(mut self) -> Self {
        self.verification_enabled = true;
        self
    }

    /// Set the minimum confidence threshold
    pub fn min_confidence(mut self, threshold: f64) -> Self {
        self.min_confidence = threshold;
        self
    }
}

/// Top-level service configuration, loadable from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Stream transport settings
    #[serde(default)]
    pub stream: StreamConfig,

    /// Workflow settings
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Retry policy for dispatch-level transient errors
    #[serde(default)]
    pub retry: RetryConfig,

    /// Default viewport for new sessions
    #[serde(default)]
    pub viewport: ViewportConfig,
}

impl ServiceConfig {
    /// Load from a TOML file
    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::error::Error::invalid_params(format!("bad config: {}", e)))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewport_defaults() {
        let v = ViewportConfig::new();
        assert_eq!(v.width, 1280);
        assert_eq!(v.height, 720);
        assert_eq!(v.fps, 15);
    }

    #[test]
    fn test_session_config_builder() {
        let cfg = SessionConfig::new("demo")
            .initial_url("https://example.com")
            .viewport(ViewportConfig::new().size(1920, 1080).fps(30))
            .no_stream();

        assert_eq!(cfg.room_name, "demo");
        assert_eq!(cfg.initial_url.as_deref(), Some("https://example.com"));
        assert_eq!(cfg.viewport.width, 1920);
        assert!(!cfg.stream_mode);
    }

    #[test]
    fn test_stream_defaults() {
        let cfg = StreamConfig::new();
        assert_eq!(cfg.command_group, "browser_agent_cluster");
        assert_eq!(cfg.max_len, 10_000);
        assert_eq!(cfg.dedup_ttl_secs, 300);
        assert_eq!(cfg.claim_idle_secs, 60);
    }

    #[test]
    fn test_retry_backoff() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff_ms(0), 1000);
        assert_eq!(retry.backoff_ms(1), 2000);
        assert_eq!(retry.backoff_ms(2), 4000);
        assert_eq!(retry.backoff_ms(10), 60_000);
    }

    #[test]
    fn test_service_config_toml() {
        let toml_src = r#"
            [stream]
            max_len = 500

            [workflow]
            verification_enabled = true
        "#;
        let cfg: ServiceConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.stream.max_len, 500);
        assert!(cfg.workflow.verification_enabled);
        assert_eq!(cfg.workflow.checkpoint_every, 100);
    }
}
