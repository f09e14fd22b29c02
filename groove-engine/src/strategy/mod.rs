//! Adaptive strategies for learning injection
//!
//! Chooses how each learning is delivered via Thompson sampling over a
//! two-level hierarchy (category distributions, per-learning overrides) and
//! learns from the attribution engine's verdicts.

mod arena;
mod consumer;
mod learner;
mod novelty;
mod router;
mod store;
mod types;
mod updater;

pub use arena::{ArenaKey, DistributionArena, Versioned};
pub use consumer::{
    StrategyConsumer, StrategyConsumerConfig, StrategyConsumerResult, start_strategy_consumer,
    strategy_consumer_loop,
};
pub use learner::{SessionContext, StrategyLearner, sample_strategy, thompson_select};
pub use novelty::{NoOpNoveltyHook, NoveltyHook};
pub use router::{OutcomeRouter, OutcomeRouterConfig, aggregate_direct_signals};
pub use store::{
    CozoStrategyStore, RecordedSelections, StrategyStore, StrategyWrite, UsedStrategyProvider,
};
pub use types::{
    BACKGROUND_TIMEOUT_MS, CallbackMethod, ContextPosition, DEFAULT_DEFERRAL_MESSAGES,
    DeferralTrigger, DistributionKey, InjectionFormat, InjectionStrategy,
    LearningStrategyOverride, OutcomeSource, OverrideState, ParseStrategyVariantError,
    PriorsConfig, StrategyDistribution, StrategyEvent, StrategyOutcome, StrategyParams,
    StrategyVariant, StrategyWeights, SubagentType, VariantParams, effective_weights,
};
pub use updater::{DistributionUpdate, DistributionUpdater, UpdaterConfig};
