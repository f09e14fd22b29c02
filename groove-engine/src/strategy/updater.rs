//! Distribution updater for the strategy feedback loop
//!
//! Per learning the override moves one way, `Inheriting -> Specialized`,
//! once its outcome count reaches the specialization threshold. Only an
//! explicit operator reset goes back.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Learning;

use super::types::{
    InjectionStrategy, LearningStrategyOverride, StrategyDistribution, StrategyOutcome,
    observe_weights,
};

/// `[strategy.updater]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Outcomes after which a learning gets its own weights
    pub specialization_threshold: u32,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            specialization_threshold: 20,
        }
    }
}

/// Distribution and override after one outcome
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionUpdate {
    pub distribution: StrategyDistribution,
    pub override_: LearningStrategyOverride,
    /// This outcome moved the learning to `Specialized`
    pub specialized_now: bool,
}

/// Applies routed outcomes to the distribution hierarchy
#[derive(Debug, Clone, Default)]
pub struct DistributionUpdater {
    config: UpdaterConfig,
}

impl DistributionUpdater {
    pub fn new(config: UpdaterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Apply one outcome.
    ///
    /// The category distribution always learns. The override counts the
    /// outcome; on reaching the threshold it copies the (already updated)
    /// category weights, and from then on its own weights learn as well.
    pub fn apply(
        &self,
        mut distribution: StrategyDistribution,
        override_: Option<LearningStrategyOverride>,
        learning: &Learning,
        strategy: &InjectionStrategy,
        outcome: &StrategyOutcome,
    ) -> DistributionUpdate {
        distribution.observe(strategy, outcome);

        let mut override_ = override_
            .unwrap_or_else(|| LearningStrategyOverride::new(learning.id, learning.category));
        let was_specialized = override_.is_specialized();
        override_.session_count = override_.session_count.saturating_add(1);
        override_.updated_at = distribution.updated_at;

        let specialized_now =
            !was_specialized && override_.session_count >= self.config.specialization_threshold;
        if specialized_now {
            override_.specialize_from(&distribution);
            info!(
                learning_id = %learning.id,
                sessions = override_.session_count,
                distribution = %distribution.key(),
                "Learning specialized its strategy weights"
            );
        }

        if was_specialized
            && let (Some(weights), Some(params)) = (
                override_.specialized_weights.as_mut(),
                override_.specialized_params.as_mut(),
            )
        {
            observe_weights(weights, params, strategy, outcome);
        }

        DistributionUpdate {
            distribution,
            override_,
            specialized_now,
        }
    }
}
