//! Strategy types for adaptive injection
//!
//! Defines injection strategies, the hierarchical weight distributions they
//! are sampled from, outcomes, and the audit events written per outcome.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AdaptiveParam, ContextType, EventId, LearningCategory, LearningId, SessionId};

/// How a learning is delivered into a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum InjectionStrategy {
    /// Inject into the main assistant context
    MainContext {
        position: ContextPosition,
        format: InjectionFormat,
    },

    /// Delegate to a subagent
    Subagent {
        agent_type: SubagentType,
        blocking: bool,
    },

    /// Run in background, surface later
    BackgroundSubagent {
        agent_type: SubagentType,
        callback: CallbackMethod,
        timeout_ms: u64,
    },

    /// Don't inject now, wait for a trigger
    Deferred {
        trigger: DeferralTrigger,
        max_wait_ms: Option<u64>,
    },
}

impl InjectionStrategy {
    pub fn variant(&self) -> StrategyVariant {
        StrategyVariant::from(self)
    }
}

/// Strategy kind without parameters; keys the weight distributions.
///
/// Declaration order is the safety order, least intrusive first. Sampling
/// ties resolve to the earlier variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyVariant {
    Deferred,
    MainContext,
    Subagent,
    BackgroundSubagent,
}

impl StrategyVariant {
    /// All variants in safety order
    pub const ALL: [Self; 4] = [
        Self::Deferred,
        Self::MainContext,
        Self::Subagent,
        Self::BackgroundSubagent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MainContext => "main_context",
            Self::Subagent => "subagent",
            Self::BackgroundSubagent => "background_subagent",
            Self::Deferred => "deferred",
        }
    }
}

impl std::fmt::Display for StrategyVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for parsing StrategyVariant from string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStrategyVariantError(String);

impl std::fmt::Display for ParseStrategyVariantError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown strategy variant: {}", self.0)
    }
}

impl std::error::Error for ParseStrategyVariantError {}

impl FromStr for StrategyVariant {
    type Err = ParseStrategyVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| ParseStrategyVariantError(s.to_string()))
    }
}

impl From<&InjectionStrategy> for StrategyVariant {
    fn from(strategy: &InjectionStrategy) -> Self {
        match strategy {
            InjectionStrategy::MainContext { .. } => Self::MainContext,
            InjectionStrategy::Subagent { .. } => Self::Subagent,
            InjectionStrategy::BackgroundSubagent { .. } => Self::BackgroundSubagent,
            InjectionStrategy::Deferred { .. } => Self::Deferred,
        }
    }
}

/// Where to position the learning in context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPosition {
    Prefix,
    Suffix,
    /// Near relevant content
    Contextual,
}

impl ContextPosition {
    pub const ALL: [Self; 3] = [Self::Prefix, Self::Suffix, Self::Contextual];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prefix => "prefix",
            Self::Suffix => "suffix",
            Self::Contextual => "contextual",
        }
    }
}

/// How to format the learning for injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionFormat {
    Plain,
    /// Structured with tags
    Tagged,
    SystemInstruction,
}

impl InjectionFormat {
    pub const ALL: [Self; 3] = [Self::Plain, Self::Tagged, Self::SystemInstruction];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Tagged => "tagged",
            Self::SystemInstruction => "system_instruction",
        }
    }
}

/// Type of subagent to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentType {
    General,
    Explorer,
    Planner,
}

impl SubagentType {
    pub const ALL: [Self; 3] = [Self::General, Self::Explorer, Self::Planner];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Explorer => "explorer",
            Self::Planner => "planner",
        }
    }
}

/// How to receive results from a background subagent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackMethod {
    Poll,
    Wait,
    /// Notify via event
    Event,
}

impl CallbackMethod {
    pub const ALL: [Self; 3] = [Self::Poll, Self::Wait, Self::Event];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Wait => "wait",
            Self::Event => "event",
        }
    }
}

/// What triggers deferred injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", content = "count", rename_all = "snake_case")]
pub enum DeferralTrigger {
    /// User explicitly requests
    Explicit,
    /// Related topic comes up
    TopicMatch,
    /// Error occurs that the learning addresses
    ErrorMatch,
    /// After N messages
    MessageCount(u32),
}

impl DeferralTrigger {
    /// One representative per trigger kind
    pub const ALL: [Self; 4] = [
        Self::Explicit,
        Self::TopicMatch,
        Self::ErrorMatch,
        Self::MessageCount(DEFAULT_DEFERRAL_MESSAGES),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::TopicMatch => "topic_match",
            Self::ErrorMatch => "error_match",
            Self::MessageCount(_) => "message_count",
        }
    }
}

/// Messages to wait for a `MessageCount` trigger
pub const DEFAULT_DEFERRAL_MESSAGES: u32 = 5;

/// Timeout given to background subagents
pub const BACKGROUND_TIMEOUT_MS: u64 = 30_000;

/// Adaptive weights over the options of each strategy parameter.
///
/// Options are keyed by their `as_str` name; a missing option has an
/// uninformed prior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    pub position: BTreeMap<String, AdaptiveParam>,
    pub format: BTreeMap<String, AdaptiveParam>,
    pub agent_type: BTreeMap<String, AdaptiveParam>,
    /// Belief that blocking on the subagent helps
    pub blocking: AdaptiveParam,
    pub callback: BTreeMap<String, AdaptiveParam>,
    pub trigger: BTreeMap<String, AdaptiveParam>,
}

impl StrategyParams {
    /// Credit the parameter choices `strategy` made with an outcome
    pub fn observe(&mut self, strategy: &InjectionStrategy, value: f64, confidence: f64) {
        fn credit(weights: &mut BTreeMap<String, AdaptiveParam>, option: &str, v: f64, c: f64) {
            weights.entry(option.to_string()).or_default().observe(v, c);
        }

        match strategy {
            InjectionStrategy::MainContext { position, format } => {
                credit(&mut self.position, position.as_str(), value, confidence);
                credit(&mut self.format, format.as_str(), value, confidence);
            }
            InjectionStrategy::Subagent {
                agent_type,
                blocking,
            } => {
                credit(&mut self.agent_type, agent_type.as_str(), value, confidence);
                let signed = if *blocking { value } else { -value };
                self.blocking.observe(signed, confidence);
            }
            InjectionStrategy::BackgroundSubagent {
                agent_type,
                callback,
                ..
            } => {
                credit(&mut self.agent_type, agent_type.as_str(), value, confidence);
                credit(&mut self.callback, callback.as_str(), value, confidence);
            }
            InjectionStrategy::Deferred { trigger, .. } => {
                credit(&mut self.trigger, trigger.as_str(), value, confidence);
            }
        }
    }
}

/// Variant weights of one distribution
pub type StrategyWeights = BTreeMap<StrategyVariant, AdaptiveParam>;

/// Per-variant parameter weights of one distribution
pub type VariantParams = BTreeMap<StrategyVariant, StrategyParams>;

/// `[strategy.priors]` section: cold-start weights for every variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorsConfig {
    /// Pseudo-count total of each prior; higher means slower to move
    pub strength: f64,
    pub main_context: f64,
    pub subagent: f64,
    pub background_subagent: f64,
    pub deferred: f64,
}

impl Default for PriorsConfig {
    fn default() -> Self {
        Self {
            strength: 10.0,
            main_context: 0.3,
            subagent: 0.2,
            background_subagent: 0.1,
            deferred: 0.4,
        }
    }
}

impl PriorsConfig {
    pub fn weight_for(&self, variant: StrategyVariant) -> f64 {
        match variant {
            StrategyVariant::MainContext => self.main_context,
            StrategyVariant::Subagent => self.subagent,
            StrategyVariant::BackgroundSubagent => self.background_subagent,
            StrategyVariant::Deferred => self.deferred,
        }
    }

    /// `(config key, weight)` for every variant
    pub fn named_weights(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        StrategyVariant::ALL
            .into_iter()
            .map(|v| (v.as_str(), self.weight_for(v)))
    }

    pub fn weights(&self) -> StrategyWeights {
        StrategyVariant::ALL
            .into_iter()
            .map(|v| (v, AdaptiveParam::from_mean(self.weight_for(v), self.strength)))
            .collect()
    }
}

/// Key of a category-level distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DistributionKey {
    pub category: LearningCategory,
    pub context_type: ContextType,
}

impl DistributionKey {
    pub fn new(category: LearningCategory, context_type: ContextType) -> Self {
        Self {
            category,
            context_type,
        }
    }
}

impl std::fmt::Display for DistributionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.category, self.context_type)
    }
}

/// Category-level weights for one (category, context type) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDistribution {
    pub category: LearningCategory,
    pub context_type: ContextType,
    pub strategy_weights: StrategyWeights,
    pub strategy_params: VariantParams,
    pub session_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl StrategyDistribution {
    /// Fresh distribution from the default priors
    pub fn new(category: LearningCategory, context_type: ContextType) -> Self {
        Self::with_priors(category, context_type, &PriorsConfig::default())
    }

    pub fn with_priors(
        category: LearningCategory,
        context_type: ContextType,
        priors: &PriorsConfig,
    ) -> Self {
        Self {
            category,
            context_type,
            strategy_weights: priors.weights(),
            strategy_params: VariantParams::new(),
            session_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> DistributionKey {
        DistributionKey::new(self.category, self.context_type)
    }

    pub fn get_weight(&self, variant: StrategyVariant) -> Option<&AdaptiveParam> {
        self.strategy_weights.get(&variant)
    }

    /// Fold one outcome of `strategy` into the matching variant and its parameters
    pub fn observe(&mut self, strategy: &InjectionStrategy, outcome: &StrategyOutcome) {
        observe_weights(
            &mut self.strategy_weights,
            &mut self.strategy_params,
            strategy,
            outcome,
        );
        self.session_count += 1;
        self.updated_at = Utc::now();
    }
}

pub(crate) fn observe_weights(
    weights: &mut StrategyWeights,
    params: &mut VariantParams,
    strategy: &InjectionStrategy,
    outcome: &StrategyOutcome,
) {
    let variant = strategy.variant();
    weights
        .entry(variant)
        .or_default()
        .observe(outcome.value, outcome.confidence);
    params
        .entry(variant)
        .or_default()
        .observe(strategy, outcome.value, outcome.confidence);
}

/// Whether a learning samples from its own weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideState {
    /// Samples from the category distribution
    Inheriting,
    /// Samples from its own copy
    Specialized,
}

/// Per-learning specialization of the category distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStrategyOverride {
    pub learning_id: LearningId,
    pub base_category: LearningCategory,
    /// Populated once the learning has specialized
    pub specialized_weights: Option<StrategyWeights>,
    pub specialized_params: Option<VariantParams>,
    /// Outcomes seen since creation or the last reset
    pub session_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl LearningStrategyOverride {
    pub fn new(learning_id: LearningId, base_category: LearningCategory) -> Self {
        Self {
            learning_id,
            base_category,
            specialized_weights: None,
            specialized_params: None,
            session_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn state(&self) -> OverrideState {
        if self.specialized_weights.is_some() {
            OverrideState::Specialized
        } else {
            OverrideState::Inheriting
        }
    }

    pub fn is_specialized(&self) -> bool {
        self.state() == OverrideState::Specialized
    }

    /// Take a private copy of the category weights
    pub fn specialize_from(&mut self, dist: &StrategyDistribution) {
        self.specialized_weights = Some(dist.strategy_weights.clone());
        self.specialized_params = Some(dist.strategy_params.clone());
        self.updated_at = Utc::now();
    }

    /// Operator reset back to inheriting, with a fresh session count
    pub fn clear_specialization(&mut self) {
        self.specialized_weights = None;
        self.specialized_params = None;
        self.session_count = 0;
        self.updated_at = Utc::now();
    }
}

/// Weights and parameters a learning samples from, resolving the hierarchy
pub fn effective_weights<'a>(
    override_: Option<&'a LearningStrategyOverride>,
    category_dist: &'a StrategyDistribution,
) -> (&'a StrategyWeights, &'a VariantParams) {
    if let Some(o) = override_
        && let (Some(weights), Some(params)) = (&o.specialized_weights, &o.specialized_params)
    {
        return (weights, params);
    }
    (&category_dist.strategy_weights, &category_dist.strategy_params)
}

/// Outcome of using a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyOutcome {
    /// Value contribution in [-1, 1]
    pub value: f64,
    /// Confidence in the value in [0, 1]
    pub confidence: f64,
    pub source: OutcomeSource,
}

impl StrategyOutcome {
    pub fn new(value: f64, confidence: f64, source: OutcomeSource) -> Self {
        Self {
            value: value.clamp(-1.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            source,
        }
    }
}

/// Where the outcome signal came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    Attribution,
    Direct,
    Both,
}

impl OutcomeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attribution => "attribution",
            Self::Direct => "direct",
            Self::Both => "both",
        }
    }
}

impl FromStr for OutcomeSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attribution" => Ok(Self::Attribution),
            "direct" => Ok(Self::Direct),
            "both" => Ok(Self::Both),
            _ => Err(format!("unknown outcome source: {s}")),
        }
    }
}

/// Audit record of one strategy use and its outcome; never modified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEvent {
    pub event_id: EventId,
    /// Attribution event the outcome was routed from
    pub source_event_id: EventId,
    pub learning_id: LearningId,
    pub session_id: SessionId,
    pub context_type: ContextType,
    pub strategy: InjectionStrategy,
    pub outcome: StrategyOutcome,
    pub timestamp: DateTime<Utc>,
}

impl StrategyEvent {
    pub fn new(
        source_event_id: EventId,
        learning_id: LearningId,
        session_id: SessionId,
        context_type: ContextType,
        strategy: InjectionStrategy,
        outcome: StrategyOutcome,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            source_event_id,
            learning_id,
            session_id,
            context_type,
            strategy,
            outcome,
            timestamp: Utc::now(),
        }
    }
}
