//! Temporal correlation of session signals with activation points

use serde::{Deserialize, Serialize};

use crate::types::{LightweightEvent, SignalPolarity};

/// Decay-weighted signal totals around a learning's activation points
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TemporalResult {
    pub positive_score: f64,
    pub negative_score: f64,
    /// positive - negative
    pub net_score: f64,
}

/// Weights session signals by their distance to activation points.
///
/// Implementations must weight monotonically non-increasing in distance and
/// give zero weight beyond their cutoff.
pub trait TemporalCorrelator: Send + Sync {
    /// Weight applied to a signal `distance` messages from an activation
    fn weight(&self, distance: u32) -> f64;

    /// Score `events` against `activation_points` (message indices)
    fn correlate(&self, activation_points: &[u32], events: &[LightweightEvent]) -> TemporalResult {
        if activation_points.is_empty() {
            return TemporalResult::default();
        }

        let mut result = TemporalResult::default();
        for (message_idx, signal) in events.iter().flat_map(|e| e.indexed_signals()) {
            let distance = activation_points
                .iter()
                .map(|&point| message_idx.abs_diff(point))
                .min()
                .unwrap_or(u32::MAX);
            let weight = self.weight(distance);
            if weight <= 0.0 {
                continue;
            }
            let contribution = weight * signal.confidence();
            match signal.polarity() {
                SignalPolarity::Positive => result.positive_score += contribution,
                SignalPolarity::Negative => result.negative_score += contribution,
            }
        }
        result.net_score = result.positive_score - result.negative_score;
        result
    }
}

/// `[attribution.temporal]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalConfig {
    /// λ in `exp(-λ·distance)`
    pub decay_rate: f64,
    /// Signals further than this many messages are ignored
    pub max_distance: u32,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            decay_rate: 0.2,
            max_distance: 10,
        }
    }
}

/// `weight = exp(-λ·distance)`, zero past the cutoff
#[derive(Debug, Clone, Default)]
pub struct ExponentialDecayCorrelator {
    config: TemporalConfig,
}

impl ExponentialDecayCorrelator {
    pub fn new(config: TemporalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TemporalConfig {
        &self.config
    }
}

impl TemporalCorrelator for ExponentialDecayCorrelator {
    fn weight(&self, distance: u32) -> f64 {
        if distance > self.config.max_distance {
            return 0.0;
        }
        (-self.config.decay_rate * f64::from(distance)).exp()
    }
}
