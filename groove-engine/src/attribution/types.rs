//! Records owned by the attribution engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ContextType, EventId, LearningId, LearningStatus, LightweightEvent, SessionId};

/// Evidence that a learning shaped an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationSignal {
    /// Response embedding close to the learning's embedding
    EmbeddingSimilarity { score: f64, message_idx: u32 },
    /// Response contains one of the learning's phrases
    KeywordMatch { keyword: String, message_idx: u32 },
}

impl ActivationSignal {
    pub fn message_idx(&self) -> u32 {
        match self {
            Self::EmbeddingSimilarity { message_idx, .. }
            | Self::KeywordMatch { message_idx, .. } => *message_idx,
        }
    }
}

/// Attribution of one session's outcome to one learning.
///
/// Written once when the session closes and never edited afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub learning_id: LearningId,
    pub session_id: SessionId,
    /// Session-close event that produced this record
    pub event_id: EventId,
    pub recorded_at: DateTime<Utc>,

    pub was_activated: bool,
    pub activation_confidence: f64,
    pub activation_signals: Vec<ActivationSignal>,
    /// Activation fell back to keywords because embedding failed
    pub activation_degraded: bool,

    pub temporal_positive: f64,
    pub temporal_negative: f64,
    pub net_temporal: f64,

    pub was_withheld: bool,

    pub session_outcome: f64,
    pub attributed_value: f64,
}

impl AttributionRecord {
    /// Message indices where the learning showed up, sorted and deduplicated
    pub fn activation_points(&self) -> Vec<u32> {
        let mut points: Vec<u32> = self
            .activation_signals
            .iter()
            .map(ActivationSignal::message_idx)
            .collect();
        points.sort_unstable();
        points.dedup();
        points
    }
}

/// Lifetime value estimate for a learning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningValue {
    pub learning_id: LearningId,
    pub estimated_value: f64,
    pub confidence: f64,
    /// Sessions in which the learning was present (withheld sessions excluded)
    pub session_count: u32,
    pub activation_count: u32,
    pub activation_rate: f64,

    pub temporal_value: f64,
    pub temporal_confidence: f64,
    pub ablation_value: Option<f64>,
    pub ablation_confidence: Option<f64>,

    pub status: LearningStatus,
    pub updated_at: DateTime<Utc>,
}

impl LearningValue {
    /// Starting point for a learning with no history
    pub fn new(learning_id: LearningId) -> Self {
        Self {
            learning_id,
            estimated_value: 0.0,
            confidence: 0.0,
            session_count: 0,
            activation_count: 0,
            activation_rate: 0.0,
            temporal_value: 0.0,
            temporal_confidence: 0.0,
            ablation_value: None,
            ablation_confidence: None,
            status: LearningStatus::Active,
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of one session in an ablation arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub outcome: f64,
    pub recorded_at: DateTime<Utc>,
}

impl SessionOutcome {
    pub fn new(session_id: SessionId, outcome: f64) -> Self {
        Self {
            session_id,
            outcome,
            recorded_at: Utc::now(),
        }
    }
}

/// Computed marginal effect of a learning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AblationResult {
    /// mean(with) - mean(without)
    pub marginal_value: f64,
    /// 1 - p
    pub confidence: f64,
    pub p_value: f64,
    pub is_significant: bool,
}

/// What an experiment can currently say
#[derive(Debug, Clone, PartialEq)]
pub enum AblationVerdict {
    /// Not enough (or not varied enough) data; never a negative result
    InsufficientData { reason: String },
    Complete(AblationResult),
}

/// A/B experiment for one learning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AblationExperiment {
    pub learning_id: LearningId,
    pub started_at: DateTime<Utc>,
    pub sessions_with: Vec<SessionOutcome>,
    pub sessions_without: Vec<SessionOutcome>,
    pub result: Option<AblationResult>,
}

impl AblationExperiment {
    pub fn new(learning_id: LearningId) -> Self {
        Self {
            learning_id,
            started_at: Utc::now(),
            sessions_with: Vec::new(),
            sessions_without: Vec::new(),
            result: None,
        }
    }

    /// Whether this session already has an outcome in either arm
    pub fn contains_session(&self, session_id: &SessionId) -> bool {
        self.sessions_with
            .iter()
            .chain(&self.sessions_without)
            .any(|o| &o.session_id == session_id)
    }
}

/// Decision for one (learning, session) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmAssignment {
    pub learning_id: LearningId,
    pub session_id: SessionId,
    pub withheld: bool,
    /// Position in the learning's assignment order, starting at 0
    pub sequence: u64,
    pub assigned_at: DateTime<Utc>,
}

/// Attribution output for one closed session, consumed by the strategy subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyInput {
    /// Session-close event the records were computed from
    pub event_id: EventId,
    pub session_id: SessionId,
    pub context_type: ContextType,
    pub records: Vec<AttributionRecord>,
    /// Direct signals observed during the session
    #[serde(default)]
    pub lightweight_events: Vec<LightweightEvent>,
}
