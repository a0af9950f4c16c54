//! Delay Intelligence
//!
//! Aggregates observed transition timings per (screen, action) pair or per
//! transition, producing wait-time recommendations that flow into the
//! knowledge store. Recording is synchronous and cheap; flushing happens
//! asynchronously on entity save and never blocks dispatch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

// =============================================================================
// KEYS & SAMPLES
// =============================================================================

/// Aggregation key for a timing sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelayKey {
    ScreenAction { screen_id: String, action_id: String },
    Transition { transition_id: String },
}

impl DelayKey {
    /// Key for a (screen, action) pair
    pub fn screen_action(screen_id: impl Into<String>, action_id: impl Into<String>) -> Self {
        Self::ScreenAction { screen_id: screen_id.into(), action_id: action_id.into() }
    }

    /// Key for a transition
    pub fn transition(transition_id: impl Into<String>) -> Self {
        Self::Transition { transition_id: transition_id.into() }
    }
}

/// One observed transition timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelaySample {
    pub duration_ms: u64,
    pub url_changed: bool,
    pub dom_stable: bool,
    pub network_idle: bool,
}

/// Variability band derived from the coefficient of variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariabilityBand {
    Low,
    Medium,
    High,
}

/// Aggregated timing statistics for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayStats {
    pub sample_count: usize,
    pub average_delay_ms: f64,
    pub median_delay_ms: f64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub std_dev_ms: f64,
    pub variability: VariabilityBand,
    /// average + one standard deviation
    pub recommended_wait_time_ms: f64,
    pub is_slow: bool,
    pub is_fast: bool,
    /// min(1.0, 0.5 + 0.1 * (samples - 1))
    pub confidence: f64,
}

impl DelayStats {
    /// Compute statistics over a non-empty sample set.
    pub fn from_samples(samples: &[DelaySample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len();
        let mut durations: Vec<u64> = samples.iter().map(|s| s.duration_ms).collect();
        durations.sort_unstable();

        let sum: u64 = durations.iter().sum();
        let average = sum as f64 / n as f64;
        let median = if n % 2 == 1 {
            durations[n / 2] as f64
        } else {
            (durations[n / 2 - 1] + durations[n / 2]) as f64 / 2.0
        };
        let variance = durations
            .iter()
            .map(|&d| {
                let diff = d as f64 - average;
                diff * diff
            })
            .sum::<f64>()
            / n as f64;
        let std_dev = variance.sqrt();

        let cv = if average > 0.0 { std_dev / average } else { 0.0 };
        let variability = if cv < 0.25 {
            VariabilityBand::Low
        } else if cv < 0.75 {
            VariabilityBand::Medium
        } else {
            VariabilityBand::High
        };

        Some(Self {
            sample_count: n,
            average_delay_ms: average,
            median_delay_ms: median,
            min_delay_ms: durations[0],
            max_delay_ms: durations[n - 1],
            std_dev_ms: std_dev,
            variability,
            recommended_wait_time_ms: average + std_dev,
            is_slow: average > 3000.0,
            is_fast: average < 1000.0,
            confidence: (0.5 + 0.1 * (n as f64 - 1.0)).min(1.0),
        })
    }
}

// =============================================================================
// AGGREGATOR
// =============================================================================

/// Per-process sample aggregator. `record` is called from dispatch with the
/// session lock held, so it only pushes into a map; statistics are computed
/// on drain.
#[derive(Default)]
pub struct DelayAggregator {
    samples: Mutex<HashMap<DelayKey, Vec<DelaySample>>>,
}

impl DelayAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample under a key.
    pub fn record(&self, key: DelayKey, sample: DelaySample) {
        self.samples.lock().unwrap().entry(key).or_default().push(sample);
    }

    /// Statistics for one key, if any samples exist.
    pub fn stats(&self, key: &DelayKey) -> Option<DelayStats> {
        self.samples
            .lock()
            .unwrap()
            .get(key)
            .and_then(|s| DelayStats::from_samples(s))
    }

    /// Number of samples recorded under a key
    pub fn sample_count(&self, key: &DelayKey) -> usize {
        self.samples.lock().unwrap().get(key).map(|s| s.len()).unwrap_or(0)
    }

    /// Drain all aggregated statistics, clearing the sample buffer. Called by
    /// the async flush on entity save.
    pub fn drain_stats(&self) -> Vec<(DelayKey, DelayStats)> {
        let mut samples = self.samples.lock().unwrap();
        let drained: Vec<(DelayKey, DelayStats)> = samples
            .drain()
            .filter_map(|(key, s)| DelayStats::from_samples(&s).map(|stats| (key, stats)))
            .collect();
        drained
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(duration_ms: u64) -> DelaySample {
        DelaySample { duration_ms, url_changed: true, dom_stable: true, network_idle: true }
    }

    #[test]
    fn test_stats_formulas() {
        let samples = [sample(100), sample(200), sample(300)];
        let stats = DelayStats::from_samples(&samples).unwrap();
        assert_eq!(stats.sample_count, 3);
        assert!((stats.average_delay_ms - 200.0).abs() < 1e-9);
        assert!((stats.median_delay_ms - 200.0).abs() < 1e-9);
        assert_eq!(stats.min_delay_ms, 100);
        assert_eq!(stats.max_delay_ms, 300);
        assert!((stats.confidence - 0.7).abs() < 1e-9);
        assert!(stats.is_fast);
        assert!(!stats.is_slow);
    }

    #[test]
    fn test_recommended_wait_is_avg_plus_stddev() {
        let samples = [sample(100), sample(300)];
        let stats = DelayStats::from_samples(&samples).unwrap();
        assert!((stats.std_dev_ms - 100.0).abs() < 1e-9);
        assert!((stats.recommended_wait_time_ms - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_slow_classification() {
        let stats = DelayStats::from_samples(&[sample(4000), sample(5000)]).unwrap();
        assert!(stats.is_slow);
        assert!(!stats.is_fast);
    }

    #[test]
    fn test_confidence_caps_at_one() {
        let samples: Vec<DelaySample> = (0..20).map(|_| sample(50)).collect();
        let stats = DelayStats::from_samples(&samples).unwrap();
        assert!((stats.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_variability_bands() {
        let low = DelayStats::from_samples(&[sample(100), sample(101), sample(99)]).unwrap();
        assert_eq!(low.variability, VariabilityBand::Low);

        let high = DelayStats::from_samples(&[sample(10), sample(1000), sample(5)]).unwrap();
        assert_eq!(high.variability, VariabilityBand::High);
    }

    #[test]
    fn test_aggregator_drain() {
        let agg = DelayAggregator::new();
        let key = DelayKey::screen_action("screen-1", "action-1");
        agg.record(key.clone(), sample(120));
        agg.record(key.clone(), sample(180));
        assert_eq!(agg.sample_count(&key), 2);

        let drained = agg.drain_stats();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.sample_count, 2);
        assert_eq!(agg.sample_count(&key), 0);
    }

    #[test]
    fn test_empty_samples_no_stats() {
        assert!(DelayStats::from_samples(&[]).is_none());
    }
}
