//! Attribution engine for tracking learning value
//!
//! Decides, per closed session, which learnings were used and how the
//! session went around them, and folds that into one lifetime value per
//! learning. Uncertain learnings are periodically withheld to measure their
//! causal effect directly.

mod ablation;
mod activation;
mod aggregation;
mod consumer;
mod stats;
mod store;
mod temporal;
mod types;

pub use ablation::{
    AblationConfig, AblationManager, AblationStrategy, ConservativeAblation, ExperimentUpdate,
};
pub use activation::{
    ActivationConfig, ActivationDetector, ActivationResult, HybridActivationDetector,
};
pub use aggregation::{
    AggregationConfig, SessionEvidence, ValueAggregator, combine_estimates, confidence_from_count,
};
pub use consumer::{
    AttributionConsumer, AttributionConsumerConfig, AttributionResult, AttributionSources,
    ConsumerLoopResult, LearningLoader, attribution_consumer_loop, start_attribution_consumer,
};
pub use stats::{WelchTest, welch_t_test};
pub use store::{AttributionStore, AttributionWrite, CozoAttributionStore};
pub use temporal::{
    ExponentialDecayCorrelator, TemporalConfig, TemporalCorrelator, TemporalResult,
};
pub use types::{
    AblationExperiment, AblationResult, AblationVerdict, ActivationSignal, ArmAssignment,
    AttributionRecord, LearningValue, SessionOutcome, StrategyInput,
};
