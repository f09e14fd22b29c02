//! Learning types referenced by the engine.
//!
//! Learnings are owned by the capture pipeline; the engine reads them and
//! only ever changes their status through the value aggregator.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::LearningId;

/// A captured piece of knowledge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub id: LearningId,
    pub category: LearningCategory,
    pub content: LearningContent,
    pub confidence: f64,
    pub status: LearningStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Learning {
    /// Create a new active learning with generated ID and timestamps
    pub fn new(category: LearningCategory, content: LearningContent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            category,
            content,
            confidence: 0.5, // Neutral starting confidence
            status: LearningStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Category of learning, used as the first half of the strategy prior key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningCategory {
    /// User corrected the assistant's behavior
    Correction,
    /// Successful error recovery strategies
    ErrorRecovery,
    /// Recurring code or workflow patterns
    Pattern,
    /// User preferences
    Preference,
}

impl LearningCategory {
    pub const ALL: [Self; 4] = [
        Self::Correction,
        Self::ErrorRecovery,
        Self::Pattern,
        Self::Preference,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Correction => "correction",
            Self::ErrorRecovery => "error_recovery",
            Self::Pattern => "pattern",
            Self::Preference => "preference",
        }
    }
}

impl std::fmt::Display for LearningCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for parsing LearningCategory from string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLearningCategoryError(String);

impl std::fmt::Display for ParseLearningCategoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown learning category: {}", self.0)
    }
}

impl std::error::Error for ParseLearningCategoryError {}

impl FromStr for LearningCategory {
    type Err = ParseLearningCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "correction" => Ok(Self::Correction),
            "error_recovery" => Ok(Self::ErrorRecovery),
            "pattern" => Ok(Self::Pattern),
            "preference" => Ok(Self::Preference),
            _ => Err(ParseLearningCategoryError(s.to_string())),
        }
    }
}

/// The actual content of a learning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningContent {
    /// Human-readable description of what was learned
    pub description: String,

    /// Actionable insight for injection into sessions
    pub insight: String,

    /// Explicit phrases whose appearance in a response counts as usage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

impl LearningContent {
    pub fn new(description: impl Into<String>, insight: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            insight: insight.into(),
            keywords: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Text that gets embedded when matching against responses
    pub fn embedding_text(&self) -> String {
        format!("{}\n{}", self.description, self.insight)
    }
}

/// Lifecycle status of a learning
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LearningStatus {
    #[default]
    Active,
    /// Turned off by an operator
    Disabled,
    /// Automatically deprecated for negative value
    Deprecated { reason: String },
    /// Flagged for manual review
    UnderReview,
}

impl LearningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Deprecated { .. } => "deprecated",
            Self::UnderReview => "under_review",
        }
    }

    pub fn is_deprecated(&self) -> bool {
        matches!(self, Self::Deprecated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learning_category_roundtrip() {
        for category in LearningCategory::ALL {
            let parsed = LearningCategory::from_str(category.as_str()).unwrap();
            assert_eq!(parsed, category);
        }
        assert!(LearningCategory::from_str("tool_usage").is_err());
    }

    #[test]
    fn test_new_learning_is_active() {
        let learning = Learning::new(
            LearningCategory::Preference,
            LearningContent::new("tabs", "Indent with tabs"),
        );
        assert_eq!(learning.status, LearningStatus::Active);
        assert_eq!(learning.id.get_version_num(), 7);
    }

    #[test]
    fn test_status_serialization_keeps_reason() {
        let status = LearningStatus::Deprecated {
            reason: "negative value".into(),
        };
        let json = serde_json::to_string(&status).unwrap();
        let parsed: LearningStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
        assert_eq!(parsed.as_str(), "deprecated");
    }

    #[test]
    fn test_keywords_omitted_when_empty() {
        let json = serde_json::to_value(LearningContent::new("d", "i")).unwrap();
        assert!(json.get("keywords").is_none());
    }
}
