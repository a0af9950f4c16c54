//! Telemetry Module
//!
//! Lightweight performance counters for dispatch and the agent-facing
//! surfaces: per-action duration statistics and per-endpoint call counts
//! feed workflow status reporting and the CLI serve summary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

// =============================================================================
// ACTION STATS
// =============================================================================

/// Statistics for one action type on one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStats {
    pub action_type: String,
    pub call_count: usize,
    pub error_count: usize,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub last_duration: Duration,
}

impl ActionStats {
    /// Create new stats for an action type.
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            call_count: 0,
            error_count: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            last_duration: Duration::ZERO,
        }
    }

    /// Record a call.
    pub fn record(&mut self, duration: Duration, success: bool) {
        self.call_count += 1;
        if !success {
            self.error_count += 1;
        }
        self.total_duration += duration;
        self.last_duration = duration;
        if duration < self.min_duration {
            self.min_duration = duration;
        }
        if duration > self.max_duration {
            self.max_duration = duration;
        }
    }

    /// Average call duration.
    pub fn average_duration(&self) -> Duration {
        if self.call_count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.call_count as u32
        }
    }

    /// Success ratio in [0, 1].
    pub fn success_rate(&self) -> f64 {
        if self.call_count == 0 {
            1.0
        } else {
            (self.call_count - self.error_count) as f64 / self.call_count as f64
        }
    }
}

// =============================================================================
// ENDPOINT STATS
// =============================================================================

/// Statistics for one RPC tool or REST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub call_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub total_duration: Duration,
    /// HTTP-status or error-code counts
    pub status_codes: HashMap<u16, usize>,
}

impl EndpointStats {
    /// Create new endpoint stats.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            call_count: 0,
            success_count: 0,
            error_count: 0,
            total_duration: Duration::ZERO,
            status_codes: HashMap::new(),
        }
    }

    /// Record a call outcome.
    pub fn record(&mut self, duration: Duration, status: u16) {
        self.call_count += 1;
        self.total_duration += duration;
        if (200..400).contains(&status) {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
        *self.status_codes.entry(status).or_insert(0) += 1;
    }
}

// =============================================================================
// PERFORMANCE MONITOR
// =============================================================================

/// Process-wide monitor keyed by (room, action) and endpoint.
#[derive(Default)]
pub struct PerformanceMonitor {
    actions: RwLock<HashMap<(String, String), ActionStats>>,
    endpoints: RwLock<HashMap<String, EndpointStats>>,
}

impl PerformanceMonitor {
    /// Create a new monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track one action dispatch.
    pub fn track_action(&self, room: &str, action_type: &str, duration: Duration, success: bool) {
        let mut actions = self.actions.write().unwrap();
        actions
            .entry((room.to_string(), action_type.to_string()))
            .or_insert_with(|| ActionStats::new(action_type))
            .record(duration, success);
    }

    /// Track one endpoint call.
    pub fn track_endpoint(&self, endpoint: &str, duration: Duration, status: u16) {
        let mut endpoints = self.endpoints.write().unwrap();
        endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointStats::new(endpoint))
            .record(duration, status);
    }

    /// Stats for one (room, action) pair.
    pub fn action_stats(&self, room: &str, action_type: &str) -> Option<ActionStats> {
        self.actions
            .read()
            .unwrap()
            .get(&(room.to_string(), action_type.to_string()))
            .cloned()
    }

    /// Stats for one endpoint.
    pub fn endpoint_stats(&self, endpoint: &str) -> Option<EndpointStats> {
        self.endpoints.read().unwrap().get(endpoint).cloned()
    }

    /// Total action dispatches for one room.
    pub fn room_action_count(&self, room: &str) -> usize {
        self.actions
            .read()
            .unwrap()
            .iter()
            .filter(|((r, _), _)| r == room)
            .map(|(_, s)| s.call_count)
            .sum()
    }

    /// All endpoint stats, for the serve summary.
    pub fn all_endpoints(&self) -> Vec<EndpointStats> {
        let mut stats: Vec<EndpointStats> =
            self.endpoints.read().unwrap().values().cloned().collect();
        stats.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }
}

// =============================================================================
// TESTS
// =============================================================================
