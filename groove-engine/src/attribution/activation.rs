//! Activation detection: did the assistant actually use a learning?
//!
//! Two kinds of evidence are combined. Embedding similarity between the
//! learning and each assistant message, and keyword matches against the
//! learning's phrases. When the embedder fails or times out the detector
//! falls back to keywords alone at reduced confidence; a session close is
//! never failed because of the embedder.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedder::{Embedder, cosine_similarity};
use crate::error::{GrooveError, Result};
use crate::transcript::ParsedTranscript;
use crate::types::Learning;

use super::types::ActivationSignal;

/// Output of activation detection for one learning in one session
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationResult {
    pub was_activated: bool,
    /// In [0, 1]
    pub confidence: f64,
    pub signals: Vec<ActivationSignal>,
    /// Embedding evidence was unavailable
    pub degraded: bool,
}

impl ActivationResult {
    pub fn inactive() -> Self {
        Self {
            was_activated: false,
            confidence: 0.0,
            signals: Vec::new(),
            degraded: false,
        }
    }
}

/// Decides whether a learning influenced a session
#[async_trait]
pub trait ActivationDetector: Send + Sync {
    async fn detect(
        &self,
        learning: &Learning,
        transcript: &ParsedTranscript,
        embedder: &dyn Embedder,
    ) -> Result<ActivationResult>;
}

/// `[attribution.activation]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    /// Similarity recorded as evidence, and confidence needed to count as activated
    pub similarity_threshold: f64,
    /// Added when embedding and keyword evidence agree
    pub reference_boost: f64,
    /// Multiplier on keyword confidence when embeddings are unavailable
    pub degraded_factor: f64,
    /// Deadline for each embedder call
    pub embed_timeout_ms: u64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            reference_boost: 0.15,
            degraded_factor: 0.85,
            embed_timeout_ms: 2_000,
        }
    }
}

impl ActivationConfig {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }
}

const STOP_WORDS: &[&str] = &[
    "about", "after", "always", "before", "being", "could", "every", "instead", "never",
    "other", "should", "their", "there", "these", "those", "using", "where", "which", "while",
    "would", "prefer", "rather",
];

/// Embedding similarity plus keyword matching
#[derive(Debug, Clone, Default)]
pub struct HybridActivationDetector {
    config: ActivationConfig,
}

impl HybridActivationDetector {
    pub fn new(config: ActivationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ActivationConfig {
        &self.config
    }

    /// Lowercased phrases that count as an explicit reference.
    ///
    /// Explicit keywords win; otherwise distinctive words of the insight.
    fn phrases(learning: &Learning) -> Vec<String> {
        if !learning.content.keywords.is_empty() {
            return learning
                .content
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
        }

        learning
            .content
            .insight
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
                    .to_lowercase()
            })
            .filter(|w| w.chars().count() >= 5 && !STOP_WORDS.contains(&w.as_str()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// 1 - 0.5^n for n distinct matched phrases
    fn keyword_confidence(matched: usize) -> f64 {
        if matched == 0 {
            return 0.0;
        }
        1.0 - 0.5f64.powi(matched.min(64) as i32)
    }

    async fn embed_with_deadline(
        &self,
        embedder: &dyn Embedder,
        texts: &[&str],
    ) -> Result<Vec<Vec<f32>>> {
        let timeout = self.config.embed_timeout();
        match tokio::time::timeout(timeout, embedder.embed_batch(texts)).await {
            Ok(Ok(vectors)) if vectors.len() == texts.len() => Ok(vectors),
            Ok(Ok(vectors)) => Err(GrooveError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            ))),
            Ok(Err(e)) => Err(GrooveError::Embedding(e.to_string())),
            Err(_) => Err(GrooveError::EmbeddingTimeout(self.config.embed_timeout_ms)),
        }
    }
}

#[async_trait]
impl ActivationDetector for HybridActivationDetector {
    async fn detect(
        &self,
        learning: &Learning,
        transcript: &ParsedTranscript,
        embedder: &dyn Embedder,
    ) -> Result<ActivationResult> {
        let responses: Vec<(u32, &str)> = transcript
            .assistant_messages()
            .map(|(idx, m)| (idx, m.content.as_str()))
            .collect();
        if responses.is_empty() {
            return Ok(ActivationResult::inactive());
        }

        let mut signals = Vec::new();

        // Keyword evidence
        let phrases = Self::phrases(learning);
        let mut matched = BTreeSet::new();
        for (idx, text) in &responses {
            let lower = text.to_lowercase();
            for phrase in phrases.iter().filter(|p| lower.contains(p.as_str())) {
                matched.insert(phrase.clone());
                signals.push(ActivationSignal::KeywordMatch {
                    keyword: phrase.clone(),
                    message_idx: *idx,
                });
            }
        }
        let keyword_conf = Self::keyword_confidence(matched.len());

        // Embedding evidence: learning text first, then every response
        let learning_text = learning.content.embedding_text();
        let mut texts = Vec::with_capacity(responses.len() + 1);
        texts.push(learning_text.as_str());
        texts.extend(responses.iter().map(|(_, t)| *t));

        let (confidence, degraded) = match self.embed_with_deadline(embedder, &texts).await {
            Ok(vectors) => {
                let (learning_vec, response_vecs) = vectors.split_at(1);
                let mut max_similarity: f64 = 0.0;
                for ((idx, _), vec) in responses.iter().zip(response_vecs) {
                    let similarity = f64::from(cosine_similarity(&learning_vec[0], vec));
                    max_similarity = max_similarity.max(similarity);
                    if similarity >= self.config.similarity_threshold {
                        signals.push(ActivationSignal::EmbeddingSimilarity {
                            score: similarity,
                            message_idx: *idx,
                        });
                    }
                }
                let mut confidence = max_similarity.clamp(0.0, 1.0).max(keyword_conf);
                if keyword_conf > 0.0 && max_similarity >= self.config.similarity_threshold {
                    confidence += self.config.reference_boost;
                }
                (confidence.min(1.0), false)
            }
            Err(e) => {
                warn!(
                    learning_id = %learning.id,
                    session_id = %transcript.session_id,
                    error = %e,
                    "Embedding unavailable, using keyword evidence only"
                );
                (keyword_conf * self.config.degraded_factor, true)
            }
        };

        let was_activated = confidence >= self.config.similarity_threshold;
        debug!(
            learning_id = %learning.id,
            confidence,
            was_activated,
            degraded,
            signals = signals.len(),
            "Activation detected"
        );

        Ok(ActivationResult {
            was_activated,
            confidence,
            signals,
            degraded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::{EmbedderError, EmbedderResult};
    use crate::transcript::Role;
    use crate::types::{LearningCategory, LearningContent};

    /// Embeds texts mentioning "result" along one axis, everything else along another
    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
            if text.to_lowercase().contains("result") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> EmbedderResult<Vec<f32>> {
            Err(EmbedderError::Unavailable("model not loaded".into()))
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, _text: &str) -> EmbedderResult<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![1.0, 0.0])
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    fn learning(keywords: &[&str]) -> Learning {
        Learning::new(
            LearningCategory::Correction,
            LearningContent::new("Error handling", "Return Result instead of panicking")
                .with_keywords(keywords.iter().copied()),
        )
    }

    fn transcript(reply: &str) -> ParsedTranscript {
        ParsedTranscript::new("sess-1")
            .with_message(Role::User, "please fix the parser")
            .with_message(Role::Assistant, reply)
    }

    #[tokio::test]
    async fn similar_response_activates() {
        let detector = HybridActivationDetector::default();
        let result = detector
            .detect(&learning(&[]), &transcript("Changed it to return a Result"), &AxisEmbedder)
            .await
            .unwrap();
        assert!(result.was_activated);
        assert!(!result.degraded);
        assert!(result.signals.iter().any(|s| matches!(
            s,
            ActivationSignal::EmbeddingSimilarity { message_idx: 1, .. }
        )));
    }

    #[tokio::test]
    async fn unrelated_response_does_not_activate() {
        let detector = HybridActivationDetector::default();
        let result = detector
            .detect(&learning(&["unwrap"]), &transcript("Renamed the module"), &AxisEmbedder)
            .await
            .unwrap();
        assert!(!result.was_activated);
        assert!(result.signals.is_empty());
    }

    #[tokio::test]
    async fn agreement_adds_reference_boost() {
        let detector = HybridActivationDetector::default();
        let result = detector
            .detect(
                &learning(&["result", "panicking"]),
                &transcript("No more panicking: we return a Result"),
                &AxisEmbedder,
            )
            .await
            .unwrap();
        assert!((result.confidence - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn embedder_failure_degrades_to_keywords() {
        let detector = HybridActivationDetector::default();
        let result = detector
            .detect(
                &learning(&["result", "panicking", "error", "propagate"]),
                &transcript("Propagate the error as a Result instead of panicking"),
                &FailingEmbedder,
            )
            .await
            .unwrap();
        assert!(result.degraded);
        let expected = (1.0 - 0.5f64.powi(4)) * 0.85;
        assert!((result.confidence - expected).abs() < 1e-9);
        assert!(result.was_activated);
        assert!(
            result
                .signals
                .iter()
                .all(|s| matches!(s, ActivationSignal::KeywordMatch { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn embedder_timeout_degrades_instead_of_blocking() {
        let detector = HybridActivationDetector::default();
        let result = detector
            .detect(&learning(&["result"]), &transcript("a Result"), &SlowEmbedder)
            .await
            .unwrap();
        assert!(result.degraded);
        assert!(!result.was_activated);
    }

    #[tokio::test]
    async fn transcript_without_responses_is_inactive() {
        let detector = HybridActivationDetector::default();
        let transcript = ParsedTranscript::new("s").with_message(Role::User, "hello");
        let result = detector
            .detect(&learning(&[]), &transcript, &AxisEmbedder)
            .await
            .unwrap();
        assert_eq!(result, ActivationResult::inactive());
    }

    #[test]
    fn insight_phrases_skip_short_and_stop_words() {
        let phrases = HybridActivationDetector::phrases(&learning(&[]));
        assert!(phrases.contains(&"result".to_string()));
        assert!(phrases.contains(&"panicking".to_string()));
        assert!(!phrases.contains(&"instead".to_string()));
        assert!(!phrases.contains(&"of".to_string()));
    }

    #[test]
    fn keyword_confidence_saturates() {
        assert_eq!(HybridActivationDetector::keyword_confidence(0), 0.0);
        assert!((HybridActivationDetector::keyword_confidence(1) - 0.5).abs() < 1e-12);
        assert!((HybridActivationDetector::keyword_confidence(2) - 0.75).abs() < 1e-12);
        assert!(HybridActivationDetector::keyword_confidence(1000) <= 1.0);
    }
}
