//! Attribution consumer for session-close events
//!
//! Runs the four attribution layers for every learning that was active (or
//! withheld) in a closed session, persists the per-event write set in one
//! transaction, and publishes the resulting records for the strategy
//! subsystem.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use groove_log::{EventConsumer, EventLog, SeekPosition};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::embedder::Embedder;
use crate::error::{GrooveError, Result};
use crate::locks::KeyedLocks;
use crate::retry::RetryPolicy;
use crate::transcript::{LightweightEventFetcher, ParsedTranscript, TranscriptFetcher};
use crate::types::{EventId, Learning, LearningId, LightweightEvent, SessionClosed, SessionId};

use super::ablation::{AblationManager, AblationStrategy};
use super::activation::ActivationDetector;
use super::aggregation::{SessionEvidence, ValueAggregator};
use super::store::{AttributionStore, AttributionWrite};
use super::temporal::{TemporalCorrelator, TemporalResult};
use super::types::{
    AblationVerdict, AttributionRecord, LearningValue, SessionOutcome, StrategyInput,
};

/// Loads learnings by id
#[async_trait]
pub trait LearningLoader: Send + Sync {
    async fn load(&self, id: LearningId) -> Result<Option<Learning>>;
}

/// `[attribution.consumer]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConsumerConfig {
    /// Consumer group name
    pub group: String,
    /// Maximum events per poll
    pub batch_size: usize,
    /// Poll timeout in milliseconds
    pub poll_timeout_ms: u64,
}

impl Default for AttributionConsumerConfig {
    fn default() -> Self {
        Self {
            group: "attribution".to_string(),
            batch_size: 10,
            poll_timeout_ms: 1000,
        }
    }
}

impl AttributionConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// External collaborators the attribution pipeline reads from
#[derive(Clone)]
pub struct AttributionSources {
    pub learnings: Arc<dyn LearningLoader>,
    pub transcripts: Arc<dyn TranscriptFetcher>,
    pub signals: Arc<dyn LightweightEventFetcher>,
    pub embedder: Arc<dyn Embedder>,
}

/// Result of processing one session-close event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributionResult {
    pub event_id: Option<EventId>,
    pub session_id: Option<SessionId>,
    /// New attribution records written
    pub records_written: u32,
    /// Records already stored by an earlier delivery of the same event
    pub replayed: u32,
    /// Learnings skipped, with the reason
    pub skipped: Vec<(LearningId, String)>,
    /// Learnings deprecated by this event
    pub deprecated: Vec<LearningId>,
    /// Learnings whose ablation experiment produced a result
    pub experiments_completed: Vec<LearningId>,
    /// Whether a strategy input was published downstream
    pub published: bool,
}

impl AttributionResult {
    fn new(event: &SessionClosed) -> Self {
        Self {
            event_id: Some(event.event_id),
            session_id: Some(event.session_id.clone()),
            ..Default::default()
        }
    }
}

/// Runs the attribution layers over session-close events
pub struct AttributionConsumer<A, T, S>
where
    A: ActivationDetector,
    T: TemporalCorrelator,
    S: AblationStrategy,
{
    activation_detector: Arc<A>,
    temporal_correlator: Arc<T>,
    ablation_manager: Arc<AblationManager<S>>,
    value_aggregator: ValueAggregator,
    store: Arc<dyn AttributionStore>,
    sources: AttributionSources,
    output: Arc<dyn EventLog<StrategyInput>>,
    value_locks: Arc<KeyedLocks<LearningId>>,
    retry: RetryPolicy,
    config: AttributionConsumerConfig,
}

/// Everything one learning contributes to an event's write set
struct LearningOutcome {
    record: AttributionRecord,
    value: Option<LearningValue>,
    newly_deprecated: bool,
    experiment_completed: bool,
}

impl<A, T, S> AttributionConsumer<A, T, S>
where
    A: ActivationDetector,
    T: TemporalCorrelator,
    S: AblationStrategy,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        activation_detector: Arc<A>,
        temporal_correlator: Arc<T>,
        ablation_manager: Arc<AblationManager<S>>,
        value_aggregator: ValueAggregator,
        store: Arc<dyn AttributionStore>,
        sources: AttributionSources,
        output: Arc<dyn EventLog<StrategyInput>>,
        retry: RetryPolicy,
        config: AttributionConsumerConfig,
    ) -> Self {
        Self {
            activation_detector,
            temporal_correlator,
            ablation_manager,
            value_aggregator,
            store,
            sources,
            output,
            value_locks: Arc::new(KeyedLocks::new()),
            retry,
            config,
        }
    }

    /// Share the per-learning value locks with other writers of learning values
    pub fn with_value_locks(mut self, locks: Arc<KeyedLocks<LearningId>>) -> Self {
        self.value_locks = locks;
        self
    }

    pub fn config(&self) -> &AttributionConsumerConfig {
        &self.config
    }

    /// Attribute one closed session.
    ///
    /// Safe to call again for the same event: stored records are reused and
    /// republished instead of being recomputed.
    pub async fn process_event(&self, event: &SessionClosed) -> Result<AttributionResult> {
        let mut result = AttributionResult::new(event);
        let session_id = &event.session_id;
        let learnings = event.all_learnings();
        if learnings.is_empty() {
            debug!(session_id = %session_id, "No learnings in closed session");
            return Ok(result);
        }

        let transcript = match self.sources.transcripts.fetch(session_id).await? {
            Some(t) => t,
            None => {
                warn!(
                    session_id = %session_id,
                    event_id = %event.event_id,
                    "No transcript for session, attributing without activation evidence"
                );
                ParsedTranscript::new(session_id.as_str())
            }
        };
        let lightweight_events = self.sources.signals.fetch(session_id).await?;

        // held from the first value read until the write set is committed
        let _value_guards = self
            .value_locks
            .lock_all(learnings.iter().map(|(id, _)| *id))
            .await;

        let mut write = AttributionWrite::default();
        let mut published = Vec::with_capacity(learnings.len());

        for (learning_id, withheld) in learnings {
            if let Some(existing) = self.store.get_attribution(learning_id, session_id).await? {
                result.replayed += 1;
                published.push(existing);
                continue;
            }

            let Some(learning) = self.sources.learnings.load(learning_id).await? else {
                warn!(
                    learning_id = %learning_id,
                    session_id = %session_id,
                    event_id = %event.event_id,
                    "Skipping attribution for unknown learning"
                );
                result
                    .skipped
                    .push((learning_id, GrooveError::NotFound(learning_id).to_string()));
                continue;
            };

            let outcome = match self
                .attribute(&learning, event, &transcript, &lightweight_events, withheld, &mut write)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) if e.is_invariant_violation() || e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(
                        learning_id = %learning_id,
                        session_id = %session_id,
                        event_id = %event.event_id,
                        error = %e,
                        "Skipping learning attribution"
                    );
                    result.skipped.push((learning_id, e.to_string()));
                    continue;
                }
            };

            if outcome.newly_deprecated {
                result.deprecated.push(learning_id);
            }
            if outcome.experiment_completed {
                result.experiments_completed.push(learning_id);
            }
            if let Some(value) = outcome.value {
                write.values.push(value);
            }
            published.push(outcome.record.clone());
            write.records.push(outcome.record);
        }

        result.records_written = write.records.len() as u32;
        let store = &self.store;
        let pending = &write;
        self.retry
            .run("attribution commit", || store.commit(pending))
            .await?;

        if !published.is_empty() {
            self.output
                .append(StrategyInput {
                    event_id: event.event_id,
                    session_id: session_id.clone(),
                    context_type: event.context_type,
                    records: published,
                    lightweight_events,
                })
                .await?;
            result.published = true;
        }

        Ok(result)
    }

    /// Compute one learning's record and its value/experiment updates
    async fn attribute(
        &self,
        learning: &Learning,
        event: &SessionClosed,
        transcript: &ParsedTranscript,
        lightweight_events: &[LightweightEvent],
        withheld: bool,
        write: &mut AttributionWrite,
    ) -> Result<LearningOutcome> {
        let session_id = &event.session_id;
        let outcome_value = event.outcome.value();

        let mut record = AttributionRecord {
            learning_id: learning.id,
            session_id: session_id.clone(),
            event_id: event.event_id,
            recorded_at: Utc::now(),
            was_activated: false,
            activation_confidence: 0.0,
            activation_signals: Vec::new(),
            activation_degraded: false,
            temporal_positive: 0.0,
            temporal_negative: 0.0,
            net_temporal: 0.0,
            was_withheld: withheld,
            session_outcome: outcome_value,
            attributed_value: 0.0,
        };

        let current = self.store.get_learning_value(learning.id).await?;
        let was_deprecated = current.as_ref().is_some_and(|v| v.status.is_deprecated());

        let mut value = if withheld {
            None
        } else {
            let activation = self
                .activation_detector
                .detect(learning, transcript, self.sources.embedder.as_ref())
                .await?;
            let temporal = if activation.was_activated {
                let points = {
                    let mut p: Vec<u32> =
                        activation.signals.iter().map(|s| s.message_idx()).collect();
                    p.sort_unstable();
                    p.dedup();
                    p
                };
                self.temporal_correlator.correlate(&points, lightweight_events)
            } else {
                TemporalResult::default()
            };

            let evidence = SessionEvidence {
                was_activated: activation.was_activated,
                activation_confidence: activation.confidence,
                net_temporal: temporal.net_score,
                session_outcome: outcome_value,
            };
            record.was_activated = activation.was_activated;
            record.activation_confidence = activation.confidence;
            record.activation_signals = activation.signals;
            record.activation_degraded = activation.degraded;
            record.temporal_positive = temporal.positive_score;
            record.temporal_negative = temporal.negative_score;
            record.net_temporal = temporal.net_score;
            record.attributed_value = self.value_aggregator.attributed_value(&evidence);

            let base = current.unwrap_or_else(|| LearningValue::new(learning.id));
            Some(self.value_aggregator.observe_session(base, &evidence))
        };

        let experiment = self.store.get_experiment(learning.id).await?;
        let update = self.ablation_manager.record_outcome(
            experiment,
            learning.id,
            SessionOutcome::new(session_id.clone(), outcome_value),
            withheld,
        );

        let mut experiment_completed = false;
        if let Some(update) = update {
            if let AblationVerdict::Complete(ablation) = &update.verdict {
                experiment_completed = true;
                let base = match value.take() {
                    Some(v) => v,
                    None => self
                        .store
                        .get_learning_value(learning.id)
                        .await?
                        .unwrap_or_else(|| LearningValue::new(learning.id)),
                };
                value = Some(self.value_aggregator.apply_ablation(base, ablation));
            }
            write.experiments.push(update.experiment);
        }

        let newly_deprecated = !was_deprecated
            && value.as_ref().is_some_and(|v| v.status.is_deprecated());

        debug!(
            learning_id = %learning.id,
            session_id = %session_id,
            activated = record.was_activated,
            withheld,
            net_temporal = record.net_temporal,
            attributed_value = record.attributed_value,
            "Attributed session to learning"
        );

        Ok(LearningOutcome {
            record,
            value,
            newly_deprecated,
            experiment_completed,
        })
    }
}

/// Why a consumer loop stopped
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerLoopResult {
    /// Shutdown was requested
    Shutdown,
    /// Unrecoverable error
    Error(String),
}

/// Create a consumer for `config.group` and spawn the attribution loop
pub async fn start_attribution_consumer<A, T, S>(
    input: Arc<dyn EventLog<SessionClosed>>,
    processor: Arc<AttributionConsumer<A, T, S>>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<ConsumerLoopResult>>
where
    A: ActivationDetector + 'static,
    T: TemporalCorrelator + 'static,
    S: AblationStrategy + 'static,
{
    let consumer = input.consumer(&processor.config.group).await?;
    info!(group = %processor.config.group, "Starting attribution consumer");
    Ok(tokio::spawn(attribution_consumer_loop(
        consumer, processor, shutdown,
    )))
}

/// Poll, process and commit until shutdown.
///
/// The offset is committed only after every event in the batch has been
/// persisted. A batch that hits a transient failure stays uncommitted and is
/// redelivered on the next poll.
pub async fn attribution_consumer_loop<A, T, S>(
    mut consumer: Box<dyn EventConsumer<SessionClosed>>,
    processor: Arc<AttributionConsumer<A, T, S>>,
    shutdown: CancellationToken,
) -> ConsumerLoopResult
where
    A: ActivationDetector + 'static,
    T: TemporalCorrelator + 'static,
    S: AblationStrategy + 'static,
{
    let config = processor.config();
    info!(group = %config.group, "Attribution consumer loop starting");

    if let Err(e) = consumer.seek(SeekPosition::Committed).await {
        error!(error = %e, "Failed to seek to committed offset");
        return ConsumerLoopResult::Error(format!("Seek failed: {e}"));
    }

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(group = %config.group, "Attribution consumer received shutdown signal");
                return ConsumerLoopResult::Shutdown;
            }

            poll_result = consumer.poll(config.batch_size, config.poll_timeout()) => {
                let batch = match poll_result {
                    Ok(batch) if batch.is_empty() => continue,
                    Ok(batch) => batch,
                    Err(groove_log::Error::Closed) => {
                        info!(
                            group = %config.group,
                            "Input log closed, stopping attribution consumer"
                        );
                        return ConsumerLoopResult::Shutdown;
                    }
                    Err(e) => {
                        error!(error = %e, "Poll error");
                        return ConsumerLoopResult::Error(format!("Poll failed: {e}"));
                    }
                };
                debug!(group = %config.group, count = batch.len(), "Processing attribution batch");

                let mut last_offset = None;
                let mut retry_batch = false;
                for (offset, event) in batch {
                    match processor.process_event(&event).await {
                        Ok(result) => {
                            debug!(
                                offset,
                                session_id = %event.session_id,
                                written = result.records_written,
                                replayed = result.replayed,
                                skipped = result.skipped.len(),
                                deprecated = result.deprecated.len(),
                                "Processed session-close event"
                            );
                        }
                        Err(e) if e.is_invariant_violation() => {
                            error!(
                                offset,
                                event_id = %event.event_id,
                                session_id = %event.session_id,
                                error = %e,
                                "Invariant violated while attributing session"
                            );
                            return ConsumerLoopResult::Error(e.to_string());
                        }
                        Err(e) if e.is_transient() => {
                            warn!(
                                offset,
                                event_id = %event.event_id,
                                error = %e,
                                "Transient failure, batch will be redelivered"
                            );
                            retry_batch = true;
                            break;
                        }
                        Err(e) => {
                            warn!(
                                offset,
                                event_id = %event.event_id,
                                session_id = %event.session_id,
                                error = %e,
                                "Skipping session-close event"
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
