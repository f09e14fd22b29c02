//! Lifetime value aggregation and automatic deprecation

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::LearningStatus;

use super::types::{AblationResult, LearningValue};

/// `[attribution.aggregation]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub temporal_weight: f64,
    pub ablation_weight: f64,
    /// Deprecate when the estimate falls below this
    pub deprecation_threshold: f64,
    /// ...and confidence exceeds this
    pub deprecation_confidence: f64,
    /// ...and at least this many sessions were seen
    pub min_sessions_for_deprecation: u32,
    /// Share of a session's attributed value taken from temporal evidence
    /// (the rest comes from the session outcome)
    pub temporal_share: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            temporal_weight: 0.6,
            ablation_weight: 0.4,
            deprecation_threshold: -0.3,
            deprecation_confidence: 0.8,
            min_sessions_for_deprecation: 10,
            temporal_share: 0.5,
        }
    }
}

/// What one attributed session contributes to a learning's value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionEvidence {
    pub was_activated: bool,
    pub activation_confidence: f64,
    pub net_temporal: f64,
    pub session_outcome: f64,
}

/// Folds per-session evidence and ablation results into `LearningValue`
#[derive(Debug, Clone, Default)]
pub struct ValueAggregator {
    config: AggregationConfig,
}

impl ValueAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Per-session attributed value in [-1, 1]; zero when not activated
    pub fn attributed_value(&self, evidence: &SessionEvidence) -> f64 {
        if !evidence.was_activated {
            return 0.0;
        }
        let share = self.config.temporal_share;
        let blended =
            share * evidence.net_temporal.tanh() + (1.0 - share) * evidence.session_outcome;
        (evidence.activation_confidence * blended).clamp(-1.0, 1.0)
    }

    /// Account for one session in which the learning was present
    pub fn observe_session(
        &self,
        mut value: LearningValue,
        evidence: &SessionEvidence,
    ) -> LearningValue {
        value.session_count += 1;
        if evidence.was_activated {
            value.activation_count += 1;
            let n = f64::from(value.activation_count);
            let observed = evidence.net_temporal.clamp(-1.0, 1.0);
            value.temporal_value += (observed - value.temporal_value) / n;
            value.temporal_confidence = confidence_from_count(value.activation_count);
        }
        value.activation_rate =
            f64::from(value.activation_count) / f64::from(value.session_count);
        self.refresh(value)
    }

    /// Merge an ablation result; non-significant results leave the value untouched
    pub fn apply_ablation(&self, mut value: LearningValue, result: &AblationResult) -> LearningValue {
        if !result.is_significant {
            return value;
        }
        value.ablation_value = Some(result.marginal_value.clamp(-1.0, 1.0));
        value.ablation_confidence = Some(result.confidence.clamp(0.0, 1.0));
        self.refresh(value)
    }

    /// Operator re-enable; clears any deprecation
    pub fn enable(&self, mut value: LearningValue) -> LearningValue {
        value.status = LearningStatus::Active;
        value.updated_at = Utc::now();
        value
    }

    /// Combined (value, confidence) from the sources present
    pub fn combine(&self, value: &LearningValue) -> (f64, f64) {
        let temporal = (value.temporal_value, value.temporal_confidence);
        let ablation = value.ablation_value.zip(value.ablation_confidence);
        combine_estimates(
            temporal,
            ablation,
            self.config.temporal_weight,
            self.config.ablation_weight,
        )
    }

    /// Reason to deprecate, if the value is confidently harmful
    pub fn deprecation_reason(&self, value: &LearningValue) -> Option<String> {
        let c = &self.config;
        (value.session_count >= c.min_sessions_for_deprecation
            && value.confidence > c.deprecation_confidence
            && value.estimated_value < c.deprecation_threshold)
            .then(|| {
                format!(
                    "value {:.2} below {:.2} at confidence {:.2} over {} sessions",
                    value.estimated_value,
                    c.deprecation_threshold,
                    value.confidence,
                    value.session_count
                )
            })
    }

    fn refresh(&self, mut value: LearningValue) -> LearningValue {
        let (estimated, confidence) = self.combine(&value);
        value.estimated_value = estimated;
        value.confidence = confidence;

        if value.status == LearningStatus::Active
            && let Some(reason) = self.deprecation_reason(&value)
        {
            info!(learning_id = %value.learning_id, reason = %reason, "Deprecating learning");
            value.status = LearningStatus::Deprecated { reason };
        }

        value.updated_at = Utc::now();
        value
    }
}

/// `1 - 1/(1 + ln n)`, 0 for no observations
pub fn confidence_from_count(count: u32) -> f64 {
    if count == 0 {
        return 0.0;
    }
    1.0 - 1.0 / (1.0 + f64::from(count).ln())
}

/// Confidence-weighted convex combination of the sources present.
///
/// With one source the result is that source. When all effective weights
/// are zero the configured weights are used on their own.
pub fn combine_estimates(
    temporal: (f64, f64),
    ablation: Option<(f64, f64)>,
    temporal_weight: f64,
    ablation_weight: f64,
) -> (f64, f64) {
    let Some((ablation_value, ablation_conf)) = ablation else {
        return temporal;
    };
    let (temporal_value, temporal_conf) = temporal;

    let wt = temporal_weight * temporal_conf;
    let wa = ablation_weight * ablation_conf;
    let total = wt + wa;
    if total > 0.0 {
        return (
            (temporal_value * wt + ablation_value * wa) / total,
            (temporal_conf * wt + ablation_conf * wa) / total,
        );
    }

    let base = temporal_weight + ablation_weight;
    if base > 0.0 {
        (
            (temporal_value * temporal_weight + ablation_value * ablation_weight) / base,
            0.0,
        )
    } else {
        ((temporal_value + ablation_value) / 2.0, 0.0)
    }
}
