//! Session context and the session-close event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EventId, LearningId, SessionId};

/// Kind of session a learning is delivered into.
///
/// Second half of the strategy prior key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Interactive,
    Batch,
    CodeReview,
    Planning,
}

impl ContextType {
    pub const ALL: [Self; 4] = [Self::Interactive, Self::Batch, Self::CodeReview, Self::Planning];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Batch => "batch",
            Self::CodeReview => "code_review",
            Self::Planning => "planning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl std::fmt::Display for ContextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failure,
    Abandoned,
    /// Explicit value, clamped to [-1, 1]
    Score { value: f64 },
}

impl Outcome {
    #[must_use]
    pub fn value(&self) -> f64 {
        match self {
            Self::Success => 1.0,
            Self::Partial => 0.5,
            Self::Failure => -0.5,
            Self::Abandoned => -1.0,
            Self::Score { value } => value.clamp(-1.0, 1.0),
        }
    }
}

/// A session finished; published by the transcript pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClosed {
    pub event_id: EventId,
    pub session_id: SessionId,
    pub context_type: ContextType,
    pub outcome: Outcome,
    /// Learnings injected into the session.
    pub active_learnings: Vec<LearningId>,
    /// Learnings that were eligible but withheld for ablation.
    #[serde(default)]
    pub withheld_learnings: Vec<LearningId>,
    pub closed_at: DateTime<Utc>,
}

impl SessionClosed {
    pub fn new(session_id: impl Into<SessionId>, context_type: ContextType, outcome: Outcome) -> Self {
        Self {
            event_id: EventId::new(),
            session_id: session_id.into(),
            context_type,
            outcome,
            active_learnings: Vec::new(),
            withheld_learnings: Vec::new(),
            closed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_active(mut self, ids: impl IntoIterator<Item = LearningId>) -> Self {
        self.active_learnings.extend(ids);
        self
    }

    #[must_use]
    pub fn with_withheld(mut self, ids: impl IntoIterator<Item = LearningId>) -> Self {
        self.withheld_learnings.extend(ids);
        self
    }

    /// Active and withheld learnings, deduplicated, active first.
    pub fn all_learnings(&self) -> Vec<(LearningId, bool)> {
        let mut seen = std::collections::HashSet::new();
        self.active_learnings
            .iter()
            .map(|id| (*id, false))
            .chain(self.withheld_learnings.iter().map(|id| (*id, true)))
            .filter(|(id, _)| seen.insert(*id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn outcome_values() {
        assert_eq!(Outcome::Success.value(), 1.0);
        assert_eq!(Outcome::Partial.value(), 0.5);
        assert_eq!(Outcome::Failure.value(), -0.5);
        assert_eq!(Outcome::Abandoned.value(), -1.0);
        assert_eq!(Outcome::Score { value: 3.0 }.value(), 1.0);
    }

    #[test]
    fn context_type_parse_roundtrip() {
        for ctx in ContextType::ALL {
            assert_eq!(ContextType::parse(ctx.as_str()), Some(ctx));
        }
        assert_eq!(ContextType::parse("nope"), None);
    }

    #[test]
    fn all_learnings_prefers_active_on_overlap() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let event = SessionClosed::new("s", ContextType::Interactive, Outcome::Success)
            .with_active([a])
            .with_withheld([a, b]);
        assert_eq!(event.all_learnings(), vec![(a, false), (b, true)]);
    }
}
