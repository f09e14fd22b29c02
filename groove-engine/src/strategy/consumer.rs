//! Strategy consumer for orchestrating the strategy learning pipeline
//!
//! Reads attribution output, routes an outcome per learning, applies it to
//! the distribution hierarchy and appends an audit event. One attribution
//! event is one atomic write; arena snapshots are published only after it
//! is persisted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use groove_log::{EventConsumer, EventLog, SeekPosition};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attribution::{ConsumerLoopResult, LearningLoader, StrategyInput};
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::types::{EventId, Learning, LearningId, SessionId};

use super::arena::{ArenaKey, DistributionArena};
use super::learner::SessionContext;
use super::novelty::{NoOpNoveltyHook, NoveltyHook};
use super::router::OutcomeRouter;
use super::store::{StrategyStore, StrategyWrite, UsedStrategyProvider};
use super::types::{
    DistributionKey, InjectionStrategy, LearningStrategyOverride, StrategyDistribution,
    StrategyEvent, StrategyOutcome,
};
use super::updater::DistributionUpdater;

/// `[strategy.consumer]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConsumerConfig {
    /// Consumer group name
    pub group: String,
    /// Maximum events per poll
    pub batch_size: usize,
    /// Poll timeout in milliseconds
    pub poll_timeout_ms: u64,
    /// Budget for each novelty hook call
    pub hook_timeout_ms: u64,
}

impl Default for StrategyConsumerConfig {
    fn default() -> Self {
        Self {
            group: "strategy".to_string(),
            batch_size: 10,
            poll_timeout_ms: 1000,
            hook_timeout_ms: 100,
        }
    }
}

impl StrategyConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }
}

/// Result of processing one attribution event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyConsumerResult {
    pub event_id: Option<EventId>,
    pub session_id: Option<SessionId>,
    /// Records looked at
    pub records_processed: u32,
    /// Outcomes applied to the distributions
    pub outcomes_computed: u32,
    /// Records whose outcome had already been applied
    pub duplicates: u32,
    /// Records skipped, with the reason
    pub skipped: Vec<(LearningId, String)>,
    /// Learnings that specialized on this event
    pub specialized: Vec<LearningId>,
}

impl StrategyConsumerResult {
    fn new(input: &StrategyInput) -> Self {
        Self {
            event_id: Some(input.event_id),
            session_id: Some(input.session_id.clone()),
            ..Default::default()
        }
    }
}

/// Outcome applied for one learning, kept for the hooks
struct Applied {
    learning: Learning,
    strategy: InjectionStrategy,
    outcome: StrategyOutcome,
}

/// Applies attribution output to the strategy distributions
pub struct StrategyConsumer {
    router: OutcomeRouter,
    updater: DistributionUpdater,
    arena: Arc<DistributionArena>,
    store: Arc<dyn StrategyStore>,
    learnings: Arc<dyn LearningLoader>,
    strategies: Arc<dyn UsedStrategyProvider>,
    hook: Arc<dyn NoveltyHook>,
    retry: RetryPolicy,
    config: StrategyConsumerConfig,
}

impl StrategyConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: OutcomeRouter,
        updater: DistributionUpdater,
        arena: Arc<DistributionArena>,
        store: Arc<dyn StrategyStore>,
        learnings: Arc<dyn LearningLoader>,
        strategies: Arc<dyn UsedStrategyProvider>,
        retry: RetryPolicy,
        config: StrategyConsumerConfig,
    ) -> Self {
        Self {
            router,
            updater,
            arena,
            store,
            learnings,
            strategies,
            hook: Arc::new(NoOpNoveltyHook),
            retry,
            config,
        }
    }

    /// Replace the default no-op novelty hook
    pub fn with_novelty_hook(mut self, hook: Arc<dyn NoveltyHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn config(&self) -> &StrategyConsumerConfig {
        &self.config
    }

    /// Apply one attribution event.
    ///
    /// Records already present in the audit log are counted as duplicates
    /// and not applied again, so a redelivered event is harmless.
    pub async fn process(&self, input: &StrategyInput) -> Result<StrategyConsumerResult> {
        let mut result = StrategyConsumerResult::new(input);
        let session_id = &input.session_id;
        let context = SessionContext::new(session_id.clone(), input.context_type);

        let mut guards = Vec::new();
        let mut distributions: BTreeMap<DistributionKey, StrategyDistribution> = BTreeMap::new();
        let mut overrides: HashMap<LearningId, LearningStrategyOverride> = HashMap::new();
        let mut write = StrategyWrite::default();
        let mut applied = Vec::new();
        let mut seen = HashSet::new();

        for record in &input.records {
            result.records_processed += 1;
            let learning_id = record.learning_id;

            if !seen.insert(learning_id) || self.store.has_event(learning_id, session_id).await? {
                result.duplicates += 1;
                continue;
            }
            if record.was_withheld {
                result
                    .skipped
                    .push((learning_id, "withheld for ablation".to_string()));
                continue;
            }

            let Some(learning) = self.learnings.load(learning_id).await? else {
                warn!(
                    learning_id = %learning_id,
                    session_id = %session_id,
                    event_id = %input.event_id,
                    "Skipping strategy update for unknown learning"
                );
                result
                    .skipped
                    .push((learning_id, "learning not found".to_string()));
                continue;
            };

            let Some(strategy) = self.strategies.used_strategy(session_id, learning_id).await?
            else {
                debug!(
                    learning_id = %learning_id,
                    session_id = %session_id,
                    "No recorded strategy, skipping update"
                );
                result
                    .skipped
                    .push((learning_id, "no recorded strategy".to_string()));
                continue;
            };

            let Some(outcome) = self.router.route(Some(record), &input.lightweight_events) else {
                debug!(
                    learning_id = %learning_id,
                    session_id = %session_id,
                    "No outcome signal, skipping update"
                );
                result
                    .skipped
                    .push((learning_id, "no outcome signal".to_string()));
                write.consumed_selections.push((session_id.clone(), learning_id));
                continue;
            };

            let key = DistributionKey::new(learning.category, input.context_type);
            let distribution = match distributions.remove(&key) {
                Some(dist) => dist,
                None => {
                    guards.push(self.arena.lock(ArenaKey::Distribution(key)).await);
                    (*self.arena.distribution(key).await.value).clone()
                }
            };
            guards.push(self.arena.lock(ArenaKey::Learning(learning_id)).await);
            let override_ = self
                .arena
                .override_for(learning_id)
                .await
                .map(|o| (*o.value).clone());

            let update = self
                .updater
                .apply(distribution, override_, &learning, &strategy, &outcome);
            if update.specialized_now {
                result.specialized.push(learning_id);
            }
            distributions.insert(key, update.distribution);
            overrides.insert(learning_id, update.override_);

            write.events.push(StrategyEvent::new(
                input.event_id,
                learning_id,
                session_id.clone(),
                input.context_type,
                strategy.clone(),
                outcome.clone(),
            ));
            write.consumed_selections.push((session_id.clone(), learning_id));
            result.outcomes_computed += 1;
            applied.push(Applied {
                learning,
                strategy,
                outcome,
            });
        }

        if write.is_empty() {
            return Ok(result);
        }

        write.distributions = distributions.into_values().collect();
        write.overrides = overrides.into_values().collect();
        let store = &self.store;
        let pending = &write;
        self.retry
            .run("strategy commit", || store.commit(pending))
            .await?;

        for dist in write.distributions {
            self.arena.publish_distribution(dist).await;
        }
        for o in write.overrides {
            self.arena.publish_override(o).await;
        }
        drop(guards);

        for a in &applied {
            self.notify_hook(a, &context).await;
        }
        Ok(result)
    }

    async fn notify_hook(&self, applied: &Applied, context: &SessionContext) {
        let call = self.hook.on_strategy_outcome(
            &applied.learning,
            context,
            &applied.strategy,
            &applied.outcome,
        );
        match tokio::time::timeout(self.config.hook_timeout(), call).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                learning_id = %applied.learning.id,
                session_id = %context.session_id,
                error = %e,
                "Novelty hook failed"
            ),
            Err(_) => warn!(
                learning_id = %applied.learning.id,
                session_id = %context.session_id,
                timeout_ms = self.config.hook_timeout_ms,
                "Novelty hook timed out"
            ),
        }
    }
}

/// Create a consumer for `config.group` and spawn the strategy loop
pub async fn start_strategy_consumer(
    input: Arc<dyn EventLog<StrategyInput>>,
    processor: Arc<StrategyConsumer>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<ConsumerLoopResult>> {
    let consumer = input.consumer(&processor.config.group).await?;
    info!(group = %processor.config.group, "Starting strategy consumer");
    Ok(tokio::spawn(strategy_consumer_loop(
        consumer, processor, shutdown,
    )))
}

/// Poll, process and commit until shutdown.
///
/// Same delivery contract as the attribution loop: the offset moves only
/// after the whole batch is persisted.
pub async fn strategy_consumer_loop(
    mut consumer: Box<dyn EventConsumer<StrategyInput>>,
    processor: Arc<StrategyConsumer>,
    shutdown: CancellationToken,
) -> ConsumerLoopResult {
    let config = processor.config();
    info!(group = %config.group, "Strategy consumer loop starting");

    if let Err(e) = consumer.seek(SeekPosition::Committed).await {
        error!(error = %e, "Failed to seek to committed offset");
        return ConsumerLoopResult::Error(format!("Seek failed: {e}"));
    }

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(group = %config.group, "Strategy consumer received shutdown signal");
                return ConsumerLoopResult::Shutdown;
            }

            poll_result = consumer.poll(config.batch_size, config.poll_timeout()) => {
                let batch = match poll_result {
                    Ok(batch) if batch.is_empty() => continue,
                    Ok(batch) => batch,
                    Err(groove_log::Error::Closed) => {
                        info!(
                            group = %config.group,
                            "Input log closed, stopping strategy consumer"
                        );
                        return ConsumerLoopResult::Shutdown;
                    }
                    Err(e) => {
                        error!(error = %e, "Poll error");
                        return ConsumerLoopResult::Error(format!("Poll failed: {e}"));
                    }
                };
                debug!(group = %config.group, count = batch.len(), "Processing strategy batch");

                let mut last_offset = None;
                let mut retry_batch = false;
                for (offset, input) in batch {
                    match processor.process(&input).await {
                        Ok(result) => {
                            debug!(
                                offset,
                                session_id = %input.session_id,
                                outcomes = result.outcomes_computed,
                                duplicates = result.duplicates,
                                skipped = result.skipped.len(),
                                specialized = result.specialized.len(),
                                "Processed attribution event"
                            );
                        }
                        Err(e) if e.is_invariant_violation() => {
                            error!(
                                offset,
                                event_id = %input.event_id,
                                session_id = %input.session_id,
                                error = %e,
                                "Invariant violated while updating strategies"
                            );
                            return ConsumerLoopResult::Error(e.to_string());
                        }
                        Err(e) if e.is_transient() => {
                            warn!(
                                offset,
                                event_id = %input.event_id,
                                error = %e,
                                "Transient failure, batch will be redelivered"
                            );
                            retry_batch = true;
                            break;
                        }
                        Err(e) => {
                            warn!(
                                offset,
                                event_id = %input.event_id,
                                session_id = %input.session_id,
                                error = %e,
                                "Skipping attribution event"
                            );
                        }
                    }
                    last_offset = Some(offset);
                }

                if retry_batch {
                    if let Err(e) = consumer.seek(SeekPosition::Committed).await {
                        error!(error = %e, "Failed to rewind to committed offset");
                        return ConsumerLoopResult::Error(format!("Seek failed: {e}"));
                    }
                    tokio::time::sleep(processor.retry.delay_for(0)).await;
                    continue;
                }

                if let Some(offset) = last_offset
                    && let Err(e) = consumer.commit(offset).await
                {
                    warn!(error = %e, "Failed to commit offset");
                }
            }
        }
    }
}
