//! Engine facade
//!
//! Owns the stores, the distribution arena and the strategy learner, and is
//! the one place dashboards and CLIs go through for queries and
//! administrative actions. Also wires and spawns both consumers.

use std::sync::Arc;

use groove_log::EventLog;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attribution::{
    AblationExperiment, AblationManager, AblationVerdict, AttributionConsumer,
    AttributionRecord, AttributionSources, AttributionStore, ConservativeAblation,
    ConsumerLoopResult, CozoAttributionStore, ExponentialDecayCorrelator,
    HybridActivationDetector, LearningValue, StrategyInput, ValueAggregator,
    start_attribution_consumer,
};
use crate::config::EngineConfig;
use crate::error::{GrooveError, Result};
use crate::locks::KeyedLocks;
use crate::store::GrooveDb;
use crate::strategy::{
    ArenaKey, CozoStrategyStore, DistributionArena, DistributionKey, DistributionUpdater,
    InjectionStrategy, LearningStrategyOverride, NoOpNoveltyHook, NoveltyHook, OutcomeRouter,
    RecordedSelections, SessionContext, StrategyConsumer, StrategyDistribution, StrategyEvent,
    StrategyLearner, StrategyStore, Versioned, start_strategy_consumer,
};
use crate::types::{
    ContextType, Learning, LearningCategory, LearningId, LearningStatus, Outcome, SessionClosed,
    SessionId,
};

/// One learning's delivery decision for a session
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedInjection {
    pub learning_id: LearningId,
    pub strategy: InjectionStrategy,
}

/// What to do with each candidate learning at session start
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionPlan {
    pub session_id: SessionId,
    pub context_type: ContextType,
    pub injections: Vec<PlannedInjection>,
    /// Held back by an ablation experiment
    pub withheld: Vec<LearningId>,
    /// Deprecated or disabled
    pub excluded: Vec<LearningId>,
}

impl InjectionPlan {
    pub fn active_ids(&self) -> impl Iterator<Item = LearningId> + '_ {
        self.injections.iter().map(|i| i.learning_id)
    }

    /// The session-close event matching this plan
    pub fn close(&self, outcome: Outcome) -> SessionClosed {
        SessionClosed::new(self.session_id.clone(), self.context_type, outcome)
            .with_active(self.active_ids())
            .with_withheld(self.withheld.iter().copied())
    }
}

/// Join handles of the running consumer loops
pub struct ConsumerHandles {
    pub attribution: JoinHandle<ConsumerLoopResult>,
    pub strategy: JoinHandle<ConsumerLoopResult>,
}

/// Attribution and adaptive strategy engine
pub struct GrooveEngine {
    config: EngineConfig,
    attribution_store: Arc<dyn AttributionStore>,
    strategy_store: Arc<dyn StrategyStore>,
    arena: Arc<DistributionArena>,
    learner: Arc<StrategyLearner>,
    ablation: Arc<AblationManager<ConservativeAblation>>,
    aggregator: ValueAggregator,
    value_locks: Arc<KeyedLocks<LearningId>>,
    hook: Arc<dyn NoveltyHook>,
}

impl GrooveEngine {
    /// Validate `config` and open the configured database
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let db = GrooveDb::open(&config.store)?;
        Self::with_db(config, db).await
    }

    /// Build on an existing database handle, loading persisted strategy state
    pub async fn with_db(config: EngineConfig, db: GrooveDb) -> Result<Self> {
        let attribution_store: Arc<dyn AttributionStore> =
            Arc::new(CozoAttributionStore::new(db.clone())?);
        let strategy_store: Arc<dyn StrategyStore> = Arc::new(CozoStrategyStore::new(db)?);

        let distributions = strategy_store.load_distributions().await?;
        let overrides = strategy_store.load_overrides().await?;
        let (dist_count, override_count) = (distributions.len(), overrides.len());

        let arena = Arc::new(DistributionArena::new(config.strategy.priors.clone()));
        arena.hydrate(distributions, overrides).await;

        let learner = Arc::new(StrategyLearner::new(
            Arc::clone(&arena),
            Arc::clone(&strategy_store),
            None,
        ));
        let ablation = Arc::new(AblationManager::new(
            ConservativeAblation::new(config.attribution.ablation.clone()),
            Arc::clone(&attribution_store),
            config.attribution.ablation.seed,
        ));
        let aggregator = ValueAggregator::new(config.attribution.aggregation.clone());

        info!(
            distributions = dist_count,
            overrides = override_count,
            "Groove engine ready"
        );

        Ok(Self {
            config,
            attribution_store,
            strategy_store,
            arena,
            learner,
            ablation,
            aggregator,
            value_locks: Arc::new(KeyedLocks::new()),
            hook: Arc::new(NoOpNoveltyHook),
        })
    }

    /// Replace the default no-op novelty hook
    pub fn with_novelty_hook(mut self, hook: Arc<dyn NoveltyHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn learner(&self) -> &Arc<StrategyLearner> {
        &self.learner
    }

    pub fn arena(&self) -> &Arc<DistributionArena> {
        &self.arena
    }

    pub fn attribution_store(&self) -> &Arc<dyn AttributionStore> {
        &self.attribution_store
    }

    pub fn strategy_store(&self) -> &Arc<dyn StrategyStore> {
        &self.strategy_store
    }

    // --- Session lifecycle ---

    /// Decide, for each candidate, whether and how it is injected.
    ///
    /// Deprecated and disabled learnings are excluded. Eligible learnings get
    /// their ablation arm assigned exactly once per session; calling this
    /// again for the same session reuses the stored assignment and the
    /// recorded strategy.
    pub async fn plan_session(
        &self,
        learnings: &[Learning],
        context: &SessionContext,
    ) -> Result<InjectionPlan> {
        let mut plan = InjectionPlan {
            session_id: context.session_id.clone(),
            context_type: context.context_type,
            injections: Vec::new(),
            withheld: Vec::new(),
            excluded: Vec::new(),
        };

        for learning in learnings {
            let value = self
                .attribution_store
                .get_learning_value(learning.id)
                .await?
                .unwrap_or_else(|| LearningValue::new(learning.id));

            if !is_injectable(&learning.status) || !is_injectable(&value.status) {
                plan.excluded.push(learning.id);
                continue;
            }

            let assignment = match self
                .attribution_store
                .get_assignment(learning.id, &context.session_id)
                .await?
            {
                Some(existing) => Some(existing),
                None => {
                    self.ablation
                        .assign_arm(learning, &value, &context.session_id)
                        .await?
                }
            };
            if assignment.is_some_and(|a| a.withheld) {
                plan.withheld.push(learning.id);
                continue;
            }

            let strategy = self.learner.select_and_record(learning, context).await?;
            plan.injections.push(PlannedInjection {
                learning_id: learning.id,
                strategy,
            });
        }

        debug!(
            session_id = %context.session_id,
            injected = plan.injections.len(),
            withheld = plan.withheld.len(),
            excluded = plan.excluded.len(),
            "Planned session injections"
        );
        Ok(plan)
    }

    /// Drop the session's cached selections and notify the novelty hook.
    ///
    /// Recorded selections stay in the store until the strategy consumer
    /// has applied the session's attribution.
    pub async fn end_session(&self, session_id: &SessionId) -> usize {
        let cleared = self.learner.end_session(session_id).await;
        let timeout = self.config.strategy.consumer.hook_timeout();
        match tokio::time::timeout(timeout, self.hook.on_session_end(session_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id = %session_id, error = %e, "Novelty hook failed"),
            Err(_) => warn!(
                session_id = %session_id,
                timeout_ms = timeout.as_millis() as u64,
                "Novelty hook timed out"
            ),
        }
        cleared
    }

    // --- Queries ---

    pub async fn learning_value(&self, id: LearningId) -> Result<Option<LearningValue>> {
        self.attribution_store.get_learning_value(id).await
    }

    pub async fn learning_values(&self, limit: usize) -> Result<Vec<LearningValue>> {
        self.attribution_store.list_learning_values(limit).await
    }

    pub async fn learning_values_with_status(
        &self,
        status: &LearningStatus,
    ) -> Result<Vec<LearningValue>> {
        self.attribution_store
            .learning_values_with_status(status.as_str())
            .await
    }

    pub async fn attribution_history(&self, id: LearningId) -> Result<Vec<AttributionRecord>> {
        self.attribution_store.attributions_for_learning(id).await
    }

    pub async fn session_attributions(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<AttributionRecord>> {
        self.attribution_store.attributions_for_session(session_id).await
    }

    pub async fn ablation_experiment(&self, id: LearningId) -> Result<Option<AblationExperiment>> {
        self.attribution_store.get_experiment(id).await
    }

    /// Evaluate the learning's experiment against its current data
    pub async fn ablation_verdict(&self, id: LearningId) -> Result<Option<AblationVerdict>> {
        self.ablation.check_experiment(id).await
    }

    /// Current snapshot; default priors at version 0 if never updated
    pub async fn distribution(
        &self,
        category: LearningCategory,
        context_type: ContextType,
    ) -> Versioned<StrategyDistribution> {
        self.arena
            .distribution(DistributionKey::new(category, context_type))
            .await
    }

    pub async fn learning_override(
        &self,
        id: LearningId,
    ) -> Option<Versioned<LearningStrategyOverride>> {
        self.arena.override_for(id).await
    }

    /// Newest first
    pub async fn strategy_history(
        &self,
        id: LearningId,
        limit: usize,
    ) -> Result<Vec<StrategyEvent>> {
        self.strategy_store.strategy_history(id, limit).await
    }

    // --- Administration ---

    /// Restore a deprecated or disabled learning to `Active`.
    ///
    /// Attribution history is untouched. Waits for any in-flight attribution
    /// of the learning to commit first.
    pub async fn enable_learning(&self, id: LearningId) -> Result<LearningValue> {
        let _guard = self.value_locks.lock(id).await;
        let value = self
            .attribution_store
            .get_learning_value(id)
            .await?
            .ok_or(GrooveError::NotFound(id))?;
        let previous = value.status.as_str();
        let enabled = self.aggregator.enable(value);
        self.attribution_store.put_learning_value(&enabled).await?;
        info!(learning_id = %id, previous, "Learning re-enabled");
        Ok(enabled)
    }

    /// Replace a category distribution with the configured priors
    pub async fn reset_category_distribution(
        &self,
        category: LearningCategory,
        context_type: ContextType,
    ) -> Result<StrategyDistribution> {
        let key = DistributionKey::new(category, context_type);
        let _guard = self.arena.lock(ArenaKey::Distribution(key)).await;

        let fresh = StrategyDistribution::with_priors(category, context_type, self.arena.priors());
        self.strategy_store.put_distribution(&fresh).await?;
        let version = self.arena.publish_distribution(fresh.clone()).await;
        info!(key = %key, version, "Category distribution reset to priors");
        Ok(fresh)
    }

    /// Return a learning to its category distribution
    pub async fn clear_specialization(&self, id: LearningId) -> Result<LearningStrategyOverride> {
        let _guard = self.arena.lock(ArenaKey::Learning(id)).await;

        let current = self
            .arena
            .override_for(id)
            .await
            .ok_or(GrooveError::NotFound(id))?;
        let mut cleared = (*current.value).clone();
        cleared.clear_specialization();

        self.strategy_store.put_override(&cleared).await?;
        let version = self.arena.publish_override(cleared.clone()).await;
        info!(learning_id = %id, version, "Specialization cleared");
        Ok(cleared)
    }

    // --- Consumers ---

    /// Spawn the attribution and strategy consumers.
    ///
    /// Attribution reads `sessions` and publishes to `attributions`, which the
    /// strategy consumer reads in turn.
    pub async fn spawn_consumers(
        &self,
        sessions: Arc<dyn EventLog<SessionClosed>>,
        attributions: Arc<dyn EventLog<StrategyInput>>,
        sources: AttributionSources,
        shutdown: CancellationToken,
    ) -> Result<ConsumerHandles> {
        let cfg = &self.config;

        let attribution = Arc::new(
            AttributionConsumer::new(
                Arc::new(HybridActivationDetector::new(cfg.attribution.activation.clone())),
                Arc::new(ExponentialDecayCorrelator::new(cfg.attribution.temporal.clone())),
                Arc::clone(&self.ablation),
                self.aggregator.clone(),
                Arc::clone(&self.attribution_store),
                sources.clone(),
                Arc::clone(&attributions),
                cfg.retry.clone(),
                cfg.attribution.consumer.clone(),
            )
            .with_value_locks(Arc::clone(&self.value_locks)),
        );

        let strategy = Arc::new(
            StrategyConsumer::new(
                OutcomeRouter::new(cfg.strategy.router.clone()),
                DistributionUpdater::new(cfg.strategy.updater.clone()),
                Arc::clone(&self.arena),
                Arc::clone(&self.strategy_store),
                sources.learnings,
                Arc::new(RecordedSelections(Arc::clone(&self.strategy_store))),
                cfg.retry.clone(),
                cfg.strategy.consumer.clone(),
            )
            .with_novelty_hook(Arc::clone(&self.hook)),
        );

        let attribution = start_attribution_consumer(sessions, attribution, shutdown.clone()).await?;
        let strategy = start_strategy_consumer(attributions, strategy, shutdown).await?;
        Ok(ConsumerHandles {
            attribution,
            strategy,
        })
    }
}

fn is_injectable(status: &LearningStatus) -> bool {
    !matches!(
        status,
        LearningStatus::Deprecated { .. } | LearningStatus::Disabled
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyVariant;
    use crate::types::LearningContent;

    async fn engine() -> GrooveEngine {
        let db = GrooveDb::open_mem().unwrap();
        GrooveEngine::with_db(EngineConfig::default(), db)
            .await
            .unwrap()
    }

    fn learning(category: LearningCategory) -> Learning {
        Learning::new(category, LearningContent::new("tabs", "Indent with tabs"))
    }

    #[tokio::test]
    async fn plan_excludes_deprecated_learnings() {
        let engine = engine().await;
        let keep = learning(LearningCategory::Preference);
        let drop = learning(LearningCategory::Pattern);

        let mut value = LearningValue::new(drop.id);
        value.status = LearningStatus::Deprecated {
            reason: "harmful".into(),
        };
        engine.attribution_store.put_learning_value(&value).await.unwrap();

        let context = SessionContext::new("s1", ContextType::Interactive);
        let plan = engine
            .plan_session(&[keep.clone(), drop.clone()], &context)
            .await
            .unwrap();

        assert_eq!(plan.excluded, vec![drop.id]);
        let planned = plan.injections.len() + plan.withheld.len();
        assert_eq!(planned, 1);
    }

    #[tokio::test]
    async fn replanning_a_session_is_stable() {
        let engine = engine().await;
        let l = learning(LearningCategory::Correction);
        let context = SessionContext::new("s1", ContextType::Interactive);

        let first = engine.plan_session(&[l.clone()], &context).await.unwrap();
        let second = engine.plan_session(&[l], &context).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn plan_closes_into_matching_event() {
        let engine = engine().await;
        let l = learning(LearningCategory::Correction);
        let context = SessionContext::new("s1", ContextType::Batch);

        let plan = engine.plan_session(&[l.clone()], &context).await.unwrap();
        let closed = plan.close(Outcome::Success);

        assert_eq!(closed.session_id, context.session_id);
        assert_eq!(closed.context_type, ContextType::Batch);
        let all: Vec<LearningId> = closed.all_learnings().into_iter().map(|(id, _)| id).collect();
        assert_eq!(all, vec![l.id]);
    }

    #[tokio::test]
    async fn enable_requires_a_known_learning() {
        let engine = engine().await;
        let id = Learning::new(LearningCategory::Pattern, LearningContent::new("a", "b")).id;
        let err = engine.enable_learning(id).await.unwrap_err();
        assert!(matches!(err, GrooveError::NotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn enable_waits_for_in_flight_attribution() {
        let engine = Arc::new(engine().await);
        let id = learning(LearningCategory::Correction).id;
        let mut value = LearningValue::new(id);
        value.status = LearningStatus::Deprecated {
            reason: "harmful".into(),
        };
        engine.attribution_store.put_learning_value(&value).await.unwrap();

        // an attribution consumer holding the learning between read and commit
        let in_flight = engine.value_locks.lock(id).await;
        let enable = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.enable_learning(id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!enable.is_finished());

        engine.attribution_store.put_learning_value(&value).await.unwrap();
        drop(in_flight);

        let enabled = enable.await.unwrap().unwrap();
        assert_eq!(enabled.status, LearningStatus::Active);
        let stored = engine.learning_value(id).await.unwrap().unwrap();
        assert_eq!(stored.status, LearningStatus::Active);
    }

    #[tokio::test]
    async fn reset_distribution_publishes_priors() {
        let engine = engine().await;
        let (cat, ctx) = (LearningCategory::Pattern, ContextType::CodeReview);

        let mut skewed = StrategyDistribution::new(cat, ctx);
        skewed.session_count = 40;
        engine.arena.publish_distribution(skewed).await;

        let fresh = engine.reset_category_distribution(cat, ctx).await.unwrap();
        assert_eq!(fresh.session_count, 0);

        let snapshot = engine.distribution(cat, ctx).await;
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.value.session_count, 0);

        let stored = engine
            .strategy_store
            .get_distribution(cat, ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.session_count, 0);
        assert!(stored.strategy_weights.contains_key(&StrategyVariant::Deferred));
    }

    #[tokio::test]
    async fn clear_specialization_resets_override() {
        let engine = engine().await;
        let l = learning(LearningCategory::Preference);

        let mut o = LearningStrategyOverride::new(l.id, l.category);
        o.specialize_from(&StrategyDistribution::new(l.category, ContextType::Interactive));
        engine.arena.publish_override(o).await;

        let cleared = engine.clear_specialization(l.id).await.unwrap();
        assert!(!cleared.is_specialized());
        assert_eq!(cleared.session_count, 0);

        let stored = engine.strategy_store.get_override(l.id).await.unwrap().unwrap();
        assert!(!stored.is_specialized());
        assert!(!engine.learning_override(l.id).await.unwrap().value.is_specialized());
    }

    #[tokio::test]
    async fn state_survives_reopen_on_same_db() {
        let db = GrooveDb::open_mem().unwrap();
        let (cat, ctx) = (LearningCategory::ErrorRecovery, ContextType::Planning);
        {
            let engine = GrooveEngine::with_db(EngineConfig::default(), db.clone())
                .await
                .unwrap();
            engine.reset_category_distribution(cat, ctx).await.unwrap();
        }

        let reopened = GrooveEngine::with_db(EngineConfig::default(), db).await.unwrap();
        assert_eq!(reopened.arena.distribution_count().await, 1);
        assert_eq!(reopened.distribution(cat, ctx).await.version, 1);
    }
}
