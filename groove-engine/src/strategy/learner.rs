//! Strategy learner with Thompson sampling
//!
//! Samples a strategy variant and its parameters from Beta posteriors,
//! resolving the learning's override before the category distribution.
//! Selections are cached per (session, learning) so delivery stays stable
//! for the lifetime of a session.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::Result;
use crate::types::{AdaptiveParam, ContextType, Learning, LearningId, SessionId};

use super::arena::DistributionArena;
use super::store::StrategyStore;
use super::types::{
    BACKGROUND_TIMEOUT_MS, CallbackMethod, ContextPosition, DeferralTrigger, DistributionKey,
    InjectionFormat, InjectionStrategy, StrategyParams, StrategyVariant, StrategyWeights,
    SubagentType, effective_weights,
};

/// Context for the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub context_type: ContextType,
}

impl SessionContext {
    pub fn new(session_id: impl Into<SessionId>, context_type: ContextType) -> Self {
        Self {
            session_id: session_id.into(),
            context_type,
        }
    }
}

/// Strategy learner with Thompson sampling
pub struct StrategyLearner {
    arena: Arc<DistributionArena>,
    store: Arc<dyn StrategyStore>,
    /// Session cache for lazy + consistent selection
    session_cache: RwLock<HashMap<(SessionId, LearningId), InjectionStrategy>>,
    rng: Mutex<StdRng>,
}

impl StrategyLearner {
    /// `seed` makes sampling reproducible
    pub fn new(
        arena: Arc<DistributionArena>,
        store: Arc<dyn StrategyStore>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            arena,
            store,
            session_cache: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Select a strategy for a learning in a session context.
    ///
    /// Returns the cached strategy if this session already has one for the
    /// learning, otherwise samples a new one and caches it. Two concurrent
    /// misses both end up with whichever sample was cached first.
    pub async fn select_strategy(
        &self,
        learning: &Learning,
        context: &SessionContext,
    ) -> InjectionStrategy {
        let key = (context.session_id.clone(), learning.id);
        if let Some(cached) = self.session_cache.read().await.get(&key) {
            return cached.clone();
        }

        let sampled = self.sample(learning, context).await;
        let mut cache = self.session_cache.write().await;
        cache.entry(key).or_insert(sampled).clone()
    }

    /// Select and persist the choice so outcomes can be matched to it later.
    ///
    /// A selection already stored for the pair (e.g. before a restart) wins
    /// over a fresh sample.
    pub async fn select_and_record(
        &self,
        learning: &Learning,
        context: &SessionContext,
    ) -> Result<InjectionStrategy> {
        let key = (context.session_id.clone(), learning.id);
        if let Some(cached) = self.session_cache.read().await.get(&key) {
            return Ok(cached.clone());
        }

        if let Some(stored) = self
            .store
            .get_selection(&context.session_id, learning.id)
            .await?
        {
            let mut cache = self.session_cache.write().await;
            return Ok(cache.entry(key).or_insert(stored).clone());
        }

        let strategy = self.select_strategy(learning, context).await;
        self.store
            .record_selection(&context.session_id, learning.id, &strategy)
            .await?;
        debug!(
            learning_id = %learning.id,
            session_id = %context.session_id,
            variant = %strategy.variant(),
            "Selected injection strategy"
        );
        Ok(strategy)
    }

    /// Forget every cached selection of a session; returns how many
    pub async fn end_session(&self, session_id: &SessionId) -> usize {
        let mut cache = self.session_cache.write().await;
        let before = cache.len();
        cache.retain(|(sid, _), _| sid != session_id);
        before - cache.len()
    }

    pub async fn cache_size(&self) -> usize {
        self.session_cache.read().await.len()
    }

    async fn sample(&self, learning: &Learning, context: &SessionContext) -> InjectionStrategy {
        let dist = self
            .arena
            .distribution(DistributionKey::new(learning.category, context.context_type))
            .await;
        let override_ = self.arena.override_for(learning.id).await;
        let (weights, params) =
            effective_weights(override_.as_ref().map(|o| o.value.as_ref()), &dist.value);

        let mut rng = self.rng.lock().await;
        let variant = thompson_select(weights, &mut *rng);
        sample_strategy(variant, params.get(&variant), &mut *rng)
    }
}

/// Draw once from every variant's posterior and keep the highest.
///
/// Variants are visited in safety order and only a strictly greater draw
/// replaces the leader, so exact ties go to the less intrusive variant.
/// With no weights at all the answer is `Deferred`.
pub fn thompson_select<R: Rng + ?Sized>(weights: &StrategyWeights, rng: &mut R) -> StrategyVariant {
    let mut best: Option<(StrategyVariant, f64)> = None;
    for variant in StrategyVariant::ALL {
        let Some(param) = weights.get(&variant) else {
            continue;
        };
        let draw = param.sample_with(rng);
        if best.is_none_or(|(_, leader)| draw > leader) {
            best = Some((variant, draw));
        }
    }
    best.map_or(StrategyVariant::Deferred, |(variant, _)| variant)
}

/// Fill in the parameters of `variant`, Thompson-sampling each dimension
pub fn sample_strategy<R: Rng + ?Sized>(
    variant: StrategyVariant,
    params: Option<&StrategyParams>,
    rng: &mut R,
) -> InjectionStrategy {
    let empty = StrategyParams::default();
    let params = params.unwrap_or(&empty);

    match variant {
        StrategyVariant::MainContext => InjectionStrategy::MainContext {
            position: pick(&ContextPosition::ALL, ContextPosition::as_str, &params.position, rng),
            format: pick(&InjectionFormat::ALL, InjectionFormat::as_str, &params.format, rng),
        },
        StrategyVariant::Subagent => InjectionStrategy::Subagent {
            agent_type: pick(&SubagentType::ALL, SubagentType::as_str, &params.agent_type, rng),
            blocking: params.blocking.sample_with(rng) >= 0.5,
        },
        StrategyVariant::BackgroundSubagent => InjectionStrategy::BackgroundSubagent {
            agent_type: pick(&SubagentType::ALL, SubagentType::as_str, &params.agent_type, rng),
            callback: pick(&CallbackMethod::ALL, CallbackMethod::as_str, &params.callback, rng),
            timeout_ms: BACKGROUND_TIMEOUT_MS,
        },
        StrategyVariant::Deferred => InjectionStrategy::Deferred {
            trigger: pick(&DeferralTrigger::ALL, DeferralTrigger::as_str, &params.trigger, rng),
            max_wait_ms: None,
        },
    }
}

fn pick<T: Copy, R: Rng + ?Sized>(
    options: &[T],
    name: fn(&T) -> &'static str,
    weights: &BTreeMap<String, AdaptiveParam>,
    rng: &mut R,
) -> T {
    let uninformed = AdaptiveParam::default();
    let mut best: Option<(T, f64)> = None;
    for option in options {
        let draw = weights
            .get(name(option))
            .unwrap_or(&uninformed)
            .sample_with(rng);
        if best.is_none_or(|(_, leader)| draw > leader) {
            best = Some((*option, draw));
        }
    }
    // options are never empty
    best.map_or(options[0], |(option, _)| option)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GrooveDb;
    use crate::strategy::store::CozoStrategyStore;
    use crate::strategy::types::{LearningStrategyOverride, PriorsConfig, StrategyDistribution};
    use crate::types::{LearningCategory, LearningContent};

    fn learning() -> Learning {
        Learning::new(
            LearningCategory::Preference,
            LearningContent::new("Prefer tabs", "Project uses tabs"),
        )
    }

    fn learner(seed: u64) -> (StrategyLearner, Arc<DistributionArena>, Arc<dyn StrategyStore>) {
        let arena = Arc::new(DistributionArena::default());
        let store: Arc<dyn StrategyStore> =
            Arc::new(CozoStrategyStore::new(GrooveDb::open_mem().unwrap()).unwrap());
        (
            StrategyLearner::new(Arc::clone(&arena), Arc::clone(&store), Some(seed)),
            arena,
            store,
        )
    }

    fn skewed(winner: StrategyVariant) -> StrategyWeights {
        StrategyVariant::ALL
            .into_iter()
            .map(|v| {
                let mean = if v == winner { 0.99 } else { 0.01 };
                (v, AdaptiveParam::from_mean(mean, 1000.0))
            })
            .collect()
    }

    #[test]
    fn thompson_follows_dominant_weight() {
        let mut rng = StdRng::seed_from_u64(1);
        for winner in StrategyVariant::ALL {
            let weights = skewed(winner);
            for _ in 0..20 {
                assert_eq!(thompson_select(&weights, &mut rng), winner);
            }
        }
    }

    #[test]
    fn thompson_ties_go_to_safest_variant() {
        // a degenerate prior cannot build a Beta and samples its mean
        let flat = AdaptiveParam {
            value: 0.5,
            uncertainty: 1.0,
            observations: 0,
            prior_alpha: 0.0,
            prior_beta: 0.0,
        };
        let weights: StrategyWeights = StrategyVariant::ALL
            .into_iter()
            .map(|v| (v, flat.clone()))
            .collect();
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(thompson_select(&weights, &mut rng), StrategyVariant::Deferred);

        let mut without_deferred = weights.clone();
        without_deferred.remove(&StrategyVariant::Deferred);
        assert_eq!(
            thompson_select(&without_deferred, &mut rng),
            StrategyVariant::MainContext
        );
        assert_eq!(
            thompson_select(&StrategyWeights::new(), &mut rng),
            StrategyVariant::Deferred
        );
    }

    #[test]
    fn parameters_follow_learned_weights() {
        let mut params = StrategyParams::default();
        let preferred = InjectionStrategy::MainContext {
            position: ContextPosition::Suffix,
            format: InjectionFormat::SystemInstruction,
        };
        let rejected = [
            InjectionStrategy::MainContext {
                position: ContextPosition::Prefix,
                format: InjectionFormat::Plain,
            },
            InjectionStrategy::MainContext {
                position: ContextPosition::Contextual,
                format: InjectionFormat::Tagged,
            },
        ];
        for _ in 0..200 {
            params.observe(&preferred, 1.0, 1.0);
            for r in &rejected {
                params.observe(r, -1.0, 1.0);
            }
        }
        let mut rng = StdRng::seed_from_u64(5);
        let sampled = sample_strategy(StrategyVariant::MainContext, Some(&params), &mut rng);
        assert_eq!(sampled, preferred);

        match sample_strategy(StrategyVariant::BackgroundSubagent, None, &mut rng) {
            InjectionStrategy::BackgroundSubagent { timeout_ms, .. } => {
                assert_eq!(timeout_ms, BACKGROUND_TIMEOUT_MS)
            }
            other => panic!("unexpected strategy {other:?}"),
        }
    }

    #[test]
    fn cold_start_prefers_deferred() {
        let weights = PriorsConfig::default().weights();
        let mut rng = StdRng::seed_from_u64(11);
        let deferred = (0..2000)
            .filter(|_| thompson_select(&weights, &mut rng) == StrategyVariant::Deferred)
            .count();
        let background = (0..2000)
            .filter(|_| thompson_select(&weights, &mut rng) == StrategyVariant::BackgroundSubagent)
            .count();
        assert!(deferred > background);
    }

    #[tokio::test]
    async fn cached_selection_survives_distribution_change() {
        let (learner, arena, _) = learner(7);
        let l = learning();
        let ctx = SessionContext::new("s1", ContextType::Interactive);

        let first = learner.select_strategy(&l, &ctx).await;

        let mut dist = StrategyDistribution::new(l.category, ctx.context_type);
        let other = StrategyVariant::ALL
            .into_iter()
            .find(|v| *v != first.variant())
            .unwrap();
        dist.strategy_weights = skewed(other);
        arena.publish_distribution(dist).await;

        assert_eq!(learner.select_strategy(&l, &ctx).await, first);
        assert_eq!(learner.cache_size().await, 1);

        // a new session sees the new weights
        let fresh = learner
            .select_strategy(&l, &SessionContext::new("s2", ContextType::Interactive))
            .await;
        assert_eq!(fresh.variant(), other);
    }

    #[tokio::test]
    async fn override_weights_take_precedence() {
        let (learner, arena, _) = learner(9);
        let l = learning();
        let mut o = LearningStrategyOverride::new(l.id, l.category);
        let mut specialized = StrategyDistribution::new(l.category, ContextType::Batch);
        specialized.strategy_weights = skewed(StrategyVariant::Subagent);
        o.specialize_from(&specialized);
        arena.publish_override(o).await;

        let mut category = StrategyDistribution::new(l.category, ContextType::Batch);
        category.strategy_weights = skewed(StrategyVariant::MainContext);
        arena.publish_distribution(category).await;

        let chosen = learner
            .select_strategy(&l, &SessionContext::new("s", ContextType::Batch))
            .await;
        assert_eq!(chosen.variant(), StrategyVariant::Subagent);
    }

    #[tokio::test]
    async fn end_session_clears_only_that_session() {
        let (learner, _, _) = learner(13);
        let a = learning();
        let b = learning();
        let s1 = SessionContext::new("s1", ContextType::Interactive);
        let s2 = SessionContext::new("s2", ContextType::Interactive);
        learner.select_strategy(&a, &s1).await;
        learner.select_strategy(&b, &s1).await;
        learner.select_strategy(&a, &s2).await;

        assert_eq!(learner.end_session(&s1.session_id).await, 2);
        assert_eq!(learner.cache_size().await, 1);
        assert_eq!(learner.end_session(&s1.session_id).await, 0);
    }

    #[tokio::test]
    async fn recorded_selection_is_reused_after_restart() {
        let (learner, arena, store) = learner(17);
        let l = learning();
        let ctx = SessionContext::new("s1", ContextType::Interactive);
        let chosen = learner.select_and_record(&l, &ctx).await.unwrap();
        assert_eq!(
            store.get_selection(&ctx.session_id, l.id).await.unwrap(),
            Some(chosen.clone())
        );

        let restarted = StrategyLearner::new(arena, Arc::clone(&store), Some(99));
        assert_eq!(restarted.select_and_record(&l, &ctx).await.unwrap(), chosen);
    }
}
