//! Ablation experiments: withhold uncertain learnings from a sampled
//! fraction of sessions and compare outcomes between the two arms.
//!
//! Only learnings below the uncertainty threshold are eligible, and only the
//! sampled fraction of their sessions is ever withheld.

use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{GrooveError, Result};
use crate::types::{Learning, LearningId, SessionId};

use super::stats::{mean, welch_t_test};
use super::store::AttributionStore;
use super::types::{
    AblationExperiment, AblationResult, AblationVerdict, ArmAssignment, LearningValue,
    SessionOutcome,
};

/// Policy deciding which sessions to withhold and how to read the results
pub trait AblationStrategy: Send + Sync {
    /// Whether the learning is uncertain enough to experiment on
    fn is_eligible(&self, learning: &Learning, value: &LearningValue) -> bool;

    /// Draw the arm for one eligible session
    fn should_withhold(&self, rng: &mut dyn RngCore) -> bool;

    /// Evaluate the experiment's current data
    fn evaluate(&self, experiment: &AblationExperiment) -> AblationVerdict;
}

/// `[attribution.ablation]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AblationConfig {
    pub enabled: bool,
    /// Only learnings with value confidence below this are eligible
    pub uncertainty_threshold: f64,
    /// Fraction of eligible sessions that get the learning withheld
    pub ablation_rate: f64,
    /// Sessions required in each arm before a result is computed
    pub min_sessions_per_arm: usize,
    /// p-value below which a result is significant
    pub significance_level: f64,
    /// Fixed RNG seed for reproducible assignment
    pub seed: Option<u64>,
}

impl Default for AblationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            uncertainty_threshold: 0.7,
            ablation_rate: 0.10,
            min_sessions_per_arm: 20,
            significance_level: 0.05,
            seed: None,
        }
    }
}

/// Experiments only on uncertain, active learnings
#[derive(Debug, Clone, Default)]
pub struct ConservativeAblation {
    config: AblationConfig,
}

impl ConservativeAblation {
    pub fn new(config: AblationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AblationConfig {
        &self.config
    }
}

impl AblationStrategy for ConservativeAblation {
    fn is_eligible(&self, _learning: &Learning, value: &LearningValue) -> bool {
        self.config.enabled
            && !value.status.is_deprecated()
            && value.confidence < self.config.uncertainty_threshold
    }

    fn should_withhold(&self, rng: &mut dyn RngCore) -> bool {
        rng.gen_bool(self.config.ablation_rate.clamp(0.0, 1.0))
    }

    fn evaluate(&self, experiment: &AblationExperiment) -> AblationVerdict {
        let min = self.config.min_sessions_per_arm;
        let (with_n, without_n) = (
            experiment.sessions_with.len(),
            experiment.sessions_without.len(),
        );
        if with_n < min || without_n < min {
            return AblationVerdict::InsufficientData {
                reason: format!("arms have {with_n} and {without_n} sessions, need {min} each"),
            };
        }

        let with: Vec<f64> = experiment.sessions_with.iter().map(|o| o.outcome).collect();
        let without: Vec<f64> = experiment.sessions_without.iter().map(|o| o.outcome).collect();
        let Some(test) = welch_t_test(&with, &without) else {
            return AblationVerdict::InsufficientData {
                reason: "zero variance in an arm".into(),
            };
        };

        AblationVerdict::Complete(AblationResult {
            marginal_value: mean(&with) - mean(&without),
            confidence: 1.0 - test.p_value,
            p_value: test.p_value,
            is_significant: test.p_value < self.config.significance_level,
        })
    }
}

/// Experiment after recording one session outcome
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentUpdate {
    pub experiment: AblationExperiment,
    pub verdict: AblationVerdict,
}

/// Assigns arms and keeps experiment results current
pub struct AblationManager<S: AblationStrategy> {
    strategy: S,
    store: Arc<dyn AttributionStore>,
    rng: Mutex<StdRng>,
}

/// Concurrent assignments for one learning retry at most this often
const MAX_CAS_RETRIES: usize = 16;

impl<S: AblationStrategy> AblationManager<S> {
    pub fn new(strategy: S, store: Arc<dyn AttributionStore>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            strategy,
            store,
            rng: Mutex::new(rng),
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Decide, once, whether `session_id` gets `learning` withheld.
    ///
    /// Returns `None` for ineligible learnings (they are always injected).
    /// A second assignment for the same pair is an invariant violation.
    pub async fn assign_arm(
        &self,
        learning: &Learning,
        value: &LearningValue,
        session_id: &SessionId,
    ) -> Result<Option<ArmAssignment>> {
        if !self.strategy.is_eligible(learning, value) {
            return Ok(None);
        }

        if self.store.get_assignment(learning.id, session_id).await?.is_some() {
            return Err(GrooveError::InvariantViolation(format!(
                "ablation arm for learning {} in session {session_id} already assigned",
                learning.id
            )));
        }

        for _ in 0..MAX_CAS_RETRIES {
            let expected = self.store.assignment_count(learning.id).await?;
            let withheld = {
                let mut rng = self.rng.lock().await;
                self.strategy.should_withhold(&mut *rng)
            };
            let assignment = ArmAssignment {
                learning_id: learning.id,
                session_id: session_id.clone(),
                withheld,
                sequence: expected,
                assigned_at: Utc::now(),
            };
            if self.store.compare_and_set_assignment(expected, &assignment).await? {
                debug!(
                    learning_id = %learning.id,
                    session_id = %session_id,
                    withheld,
                    sequence = expected,
                    "Assigned ablation arm"
                );
                return Ok(Some(assignment));
            }
        }

        Err(GrooveError::Database(format!(
            "ablation assignment for learning {} kept conflicting",
            learning.id
        )))
    }

    /// Fold one session outcome into the learning's experiment.
    ///
    /// Outcomes only start an experiment from a withheld session; present
    /// sessions are recorded once an experiment exists. Returns `None` when
    /// nothing needs to be written.
    pub fn record_outcome(
        &self,
        experiment: Option<AblationExperiment>,
        learning_id: LearningId,
        outcome: SessionOutcome,
        was_withheld: bool,
    ) -> Option<ExperimentUpdate> {
        let mut experiment = match experiment {
            Some(exp) => exp,
            None if was_withheld => AblationExperiment::new(learning_id),
            None => return None,
        };
        if experiment.contains_session(&outcome.session_id) {
            return None;
        }

        if was_withheld {
            experiment.sessions_without.push(outcome);
        } else {
            experiment.sessions_with.push(outcome);
        }

        let verdict = self.strategy.evaluate(&experiment);
        match &verdict {
            AblationVerdict::Complete(result) => {
                if experiment.result.is_none() {
                    info!(
                        learning_id = %learning_id,
                        marginal_value = result.marginal_value,
                        p_value = result.p_value,
                        significant = result.is_significant,
                        "Ablation experiment reached a result"
                    );
                }
                experiment.result = Some(result.clone());
            }
            AblationVerdict::InsufficientData { reason } => {
                debug!(learning_id = %learning_id, reason = %reason, "Ablation data insufficient");
            }
        }

        Some(ExperimentUpdate {
            experiment,
            verdict,
        })
    }

    /// Current verdict for a learning's experiment, if one exists
    pub async fn check_experiment(&self, learning_id: LearningId) -> Result<Option<AblationVerdict>> {
        Ok(self
            .store
            .get_experiment(learning_id)
            .await?
            .map(|exp| self.strategy.evaluate(&exp)))
    }
}
