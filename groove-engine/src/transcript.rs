//! Transcript and lightweight-event seams.
//!
//! Capture and parsing live outside the engine; these traits are how the
//! attribution consumer pulls what it needs for a closed session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{LightweightEvent, SessionId};

/// Role of a transcript message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A message from a transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Ordered messages of one session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedTranscript {
    pub session_id: String,
    pub messages: Vec<TranscriptMessage>,
}

impl ParsedTranscript {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, role: Role, content: impl Into<String>) -> Self {
        self.messages.push(TranscriptMessage {
            role,
            content: content.into(),
            timestamp: None,
        });
        self
    }

    /// Assistant messages with their index in the full transcript
    pub fn assistant_messages(&self) -> impl Iterator<Item = (u32, &TranscriptMessage)> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Assistant)
            .map(|(idx, m)| (idx as u32, m))
    }
}

/// Fetches the transcript of a closed session
#[async_trait]
pub trait TranscriptFetcher: Send + Sync {
    async fn fetch(&self, session_id: &SessionId) -> Result<Option<ParsedTranscript>>;
}

/// Fetches lightweight signal events recorded during a session
#[async_trait]
pub trait LightweightEventFetcher: Send + Sync {
    async fn fetch(&self, session_id: &SessionId) -> Result<Vec<LightweightEvent>>;
}
