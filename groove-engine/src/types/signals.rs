//! Lightweight per-message session signals.

use serde::{Deserialize, Serialize};

use super::SessionId;

/// Whether a signal counts for or against the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPolarity {
    Positive,
    Negative,
}

/// A lightweight signal detected in a single message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LightweightSignal {
    /// Negative sentiment (frustration, confusion).
    Negative { pattern: String, confidence: f64 },
    /// Positive sentiment (satisfaction, thanks).
    Positive { pattern: String, confidence: f64 },
    /// A tool call failed.
    ToolFailure { tool_name: String },
    /// The user corrected the assistant.
    Correction,
    /// The user asked for a retry.
    Retry,
    /// Build or test status changed.
    BuildStatus { passed: bool },
}

impl LightweightSignal {
    #[must_use]
    pub fn polarity(&self) -> SignalPolarity {
        match self {
            Self::Positive { .. } | Self::BuildStatus { passed: true } => SignalPolarity::Positive,
            _ => SignalPolarity::Negative,
        }
    }

    /// Confidence used when weighting the signal against activation points.
    #[must_use]
    pub fn confidence(&self) -> f64 {
        match self {
            Self::Positive { confidence, .. } | Self::Negative { confidence, .. } => {
                confidence.clamp(0.0, 1.0)
            }
            Self::ToolFailure { .. } => 0.8,
            Self::Correction => 0.9,
            Self::Retry => 0.7,
            Self::BuildStatus { .. } => 0.9,
        }
    }

    /// Magnitude contributed to a direct (unattributed) session score.
    ///
    /// Structural signals are discounted relative to explicit sentiment.
    #[must_use]
    pub fn direct_magnitude(&self) -> f64 {
        match self {
            Self::Positive { confidence, .. } | Self::Negative { confidence, .. } => {
                confidence.clamp(0.0, 1.0)
            }
            Self::ToolFailure { .. } => 0.5,
            Self::Correction => 0.7,
            Self::Retry => 0.3,
            Self::BuildStatus { .. } => 0.8,
        }
    }
}

/// Signals detected in one message of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightweightEvent {
    pub session_id: SessionId,
    /// 0-based message index in the session.
    pub message_idx: u32,
    pub signals: Vec<LightweightSignal>,
}

impl LightweightEvent {
    #[must_use]
    pub fn new(session_id: impl Into<SessionId>, message_idx: u32) -> Self {
        Self {
            session_id: session_id.into(),
            message_idx,
            signals: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_signal(mut self, signal: LightweightSignal) -> Self {
        self.signals.push(signal);
        self
    }

    /// Flatten into `(message_idx, signal)` pairs.
    pub fn indexed_signals(&self) -> impl Iterator<Item = (u32, &LightweightSignal)> {
        self.signals.iter().map(move |s| (self.message_idx, s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_status_polarity_follows_result() {
        assert_eq!(
            LightweightSignal::BuildStatus { passed: true }.polarity(),
            SignalPolarity::Positive
        );
        assert_eq!(
            LightweightSignal::BuildStatus { passed: false }.polarity(),
            SignalPolarity::Negative
        );
        assert_eq!(LightweightSignal::Retry.polarity(), SignalPolarity::Negative);
    }

    #[test]
    fn explicit_confidence_is_clamped() {
        let signal = LightweightSignal::Positive {
            pattern: "thanks".into(),
            confidence: 1.7,
        };
        assert_eq!(signal.confidence(), 1.0);
        assert_eq!(LightweightSignal::Correction.confidence(), 0.9);
    }

    #[test]
    fn signal_serializes_with_type_tag() {
        let json = serde_json::to_value(LightweightSignal::ToolFailure {
            tool_name: "bash".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "tool_failure");
        assert_eq!(json["tool_name"], "bash");
    }

    #[test]
    fn indexed_signals_carry_message_index() {
        let event = LightweightEvent::new("s", 4)
            .with_signal(LightweightSignal::Retry)
            .with_signal(LightweightSignal::Correction);
        let pairs: Vec<_> = event.indexed_signals().collect();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|(idx, _)| *idx == 4));
    }
}
