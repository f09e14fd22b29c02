//! groove-engine - Learning attribution and adaptive injection strategies
//!
//! Closes the groove learning loop: session outcomes are attributed to the
//! learnings that were active, attributed values drive Bayesian strategy
//! distributions, and the next session's injections are sampled from them.
//!
//! # Key Types
//!
//! - [`GrooveEngine`] - Facade for queries, administration and consumers
//! - [`attribution`] - Activation, temporal correlation, ablation, aggregation
//! - [`strategy`] - Thompson-sampled strategy selection and updating
//! - [`EngineConfig`] - TOML configuration

pub mod attribution;
pub mod config;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod locks;
pub mod retry;
pub mod store;
pub mod strategy;
pub mod transcript;
pub mod types;

pub use config::{AttributionConfig, EngineConfig, StrategyConfig};
pub use embedder::{Embedder, EmbedderError, EmbedderResult, cosine_similarity};
pub use engine::{ConsumerHandles, GrooveEngine, InjectionPlan, PlannedInjection};
pub use error::{GrooveError, Result};
pub use locks::KeyedLocks;
pub use retry::RetryPolicy;
pub use store::{GrooveDb, StoreConfig, StoreEngine};
pub use transcript::{
    LightweightEventFetcher, ParsedTranscript, Role, TranscriptFetcher, TranscriptMessage,
};
pub use types::*;

pub use attribution::{
    AttributionRecord, AttributionSources, ConsumerLoopResult, LearningLoader, LearningValue,
    StrategyInput,
};
pub use strategy::{InjectionStrategy, SessionContext, StrategyLearner, StrategyVariant};
