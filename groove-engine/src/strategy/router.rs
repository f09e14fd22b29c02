//! Outcome router for combining attribution and direct signals
//!
//! Turns an attribution record and the session's direct lightweight signals
//! into at most one strategy outcome.

use serde::{Deserialize, Serialize};

use crate::attribution::AttributionRecord;
use crate::types::{LightweightEvent, SignalPolarity};

use super::types::{OutcomeSource, StrategyOutcome};

/// `[strategy.router]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeRouterConfig {
    /// Weight of the attributed value when both sources exist
    pub attribution_weight: f64,
    /// Weight of the direct signals when both sources exist
    pub direct_weight: f64,
    pub both_confidence: f64,
    pub attribution_confidence: f64,
    pub direct_confidence: f64,
}

impl Default for OutcomeRouterConfig {
    fn default() -> Self {
        Self {
            attribution_weight: 0.7,
            direct_weight: 0.3,
            both_confidence: 0.9,
            attribution_confidence: 0.8,
            direct_confidence: 0.5,
        }
    }
}

/// Routes and combines outcome signals from both sources
#[derive(Debug, Clone, Default)]
pub struct OutcomeRouter {
    config: OutcomeRouterConfig,
}

impl OutcomeRouter {
    pub fn new(config: OutcomeRouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OutcomeRouterConfig {
        &self.config
    }

    /// Compute the outcome for one (learning, session).
    ///
    /// Attribution only counts when the learning was activated. `None` means
    /// the caller must skip the update.
    pub fn route(
        &self,
        attribution: Option<&AttributionRecord>,
        direct_events: &[LightweightEvent],
    ) -> Option<StrategyOutcome> {
        let attributed = attribution
            .filter(|a| a.was_activated && !a.was_withheld)
            .map(|a| a.attributed_value);
        let direct = aggregate_direct_signals(direct_events);
        let c = &self.config;

        match (attributed, direct) {
            (Some(av), Some(dv)) => {
                let total = c.attribution_weight + c.direct_weight;
                let blended = if total > 0.0 {
                    (c.attribution_weight * av + c.direct_weight * dv) / total
                } else {
                    (av + dv) / 2.0
                };
                Some(StrategyOutcome::new(blended, c.both_confidence, OutcomeSource::Both))
            }
            (Some(av), None) => Some(StrategyOutcome::new(
                av,
                c.attribution_confidence,
                OutcomeSource::Attribution,
            )),
            (None, Some(dv)) => Some(StrategyOutcome::new(
                dv,
                c.direct_confidence,
                OutcomeSource::Direct,
            )),
            (None, None) => None,
        }
    }
}

/// Net direct signal in [-1, 1], `None` when there is nothing to go on
pub fn aggregate_direct_signals(events: &[LightweightEvent]) -> Option<f64> {
    let (positive, negative) = events
        .iter()
        .flat_map(|e| &e.signals)
        .fold((0.0, 0.0), |(pos, neg), signal| {
            let magnitude = signal.direct_magnitude();
            match signal.polarity() {
                SignalPolarity::Positive => (pos + magnitude, neg),
                SignalPolarity::Negative => (pos, neg + magnitude),
            }
        });

    let total = positive + negative;
    (total > 0.0).then(|| (positive - negative) / total)
}
