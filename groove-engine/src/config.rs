//! Engine configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields the
//! documented behavior. Component configs live next to the component; this
//! module only assembles and validates them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::attribution::{
    AblationConfig, ActivationConfig, AggregationConfig, AttributionConsumerConfig,
    TemporalConfig,
};
use crate::error::{GrooveError, Result};
use crate::retry::RetryPolicy;
use crate::store::StoreConfig;
use crate::strategy::{OutcomeRouterConfig, PriorsConfig, StrategyConsumerConfig, UpdaterConfig};

/// Attribution engine settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    pub activation: ActivationConfig,
    pub temporal: TemporalConfig,
    pub ablation: AblationConfig,
    pub aggregation: AggregationConfig,
    pub consumer: AttributionConsumerConfig,
}

/// Strategy subsystem settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub router: OutcomeRouterConfig,
    pub updater: UpdaterConfig,
    pub priors: PriorsConfig,
    pub consumer: StrategyConsumerConfig,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub attribution: AttributionConfig,
    pub strategy: StrategyConfig,
    pub store: StoreConfig,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Default config file location (`<config_dir>/groove/engine.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("groove").join("engine.toml"))
    }

    /// Parse and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        tracing::debug!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// Like `load`, but a missing file yields the defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No engine config, using defaults");
            Ok(Self::default())
        }
    }

    /// Parse and validate TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| GrooveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break the engine's guarantees
    pub fn validate(&self) -> Result<()> {
        let a = &self.attribution;
        unit("attribution.activation.similarity_threshold", a.activation.similarity_threshold)?;
        unit("attribution.activation.reference_boost", a.activation.reference_boost)?;
        unit("attribution.activation.degraded_factor", a.activation.degraded_factor)?;
        if a.temporal.decay_rate <= 0.0 || !a.temporal.decay_rate.is_finite() {
            return Err(GrooveError::Config(
                "attribution.temporal.decay_rate must be positive".into(),
            ));
        }
        unit("attribution.ablation.uncertainty_threshold", a.ablation.uncertainty_threshold)?;
        unit("attribution.ablation.ablation_rate", a.ablation.ablation_rate)?;
        unit("attribution.ablation.significance_level", a.ablation.significance_level)?;
        if a.ablation.min_sessions_per_arm < 2 {
            return Err(GrooveError::Config(
                "attribution.ablation.min_sessions_per_arm must be at least 2".into(),
            ));
        }
        unit("attribution.aggregation.temporal_weight", a.aggregation.temporal_weight)?;
        unit("attribution.aggregation.ablation_weight", a.aggregation.ablation_weight)?;
        unit("attribution.aggregation.temporal_share", a.aggregation.temporal_share)?;
        unit(
            "attribution.aggregation.deprecation_confidence",
            a.aggregation.deprecation_confidence,
        )?;
        if !(-1.0..=1.0).contains(&a.aggregation.deprecation_threshold) {
            return Err(GrooveError::Config(
                "attribution.aggregation.deprecation_threshold must be in [-1, 1]".into(),
            ));
        }
        if a.consumer.batch_size == 0 {
            return Err(GrooveError::Config(
                "attribution.consumer.batch_size must be positive".into(),
            ));
        }

        let s = &self.strategy;
        unit("strategy.router.attribution_weight", s.router.attribution_weight)?;
        unit("strategy.router.direct_weight", s.router.direct_weight)?;
        if s.updater.specialization_threshold == 0 {
            return Err(GrooveError::Config(
                "strategy.updater.specialization_threshold must be positive".into(),
            ));
        }
        for (name, weight) in s.priors.named_weights() {
            if !(weight > 0.0 && weight < 1.0) {
                return Err(GrooveError::Config(format!(
                    "strategy.priors.{name} must be in (0, 1), got {weight}"
                )));
            }
        }
        if s.priors.strength <= 0.0 {
            return Err(GrooveError::Config(
                "strategy.priors.strength must be positive".into(),
            ));
        }
        if s.consumer.batch_size == 0 {
            return Err(GrooveError::Config(
                "strategy.consumer.batch_size must be positive".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(GrooveError::Config("retry.max_attempts must be positive".into()));
        }
        Ok(())
    }
}

fn unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(GrooveError::Config(format!("{name} must be in [0, 1], got {value}")))
    }
}
