//! Core traits for event log operations.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Position of an event in the log.
pub type Offset = u64;

/// Where a consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekPosition {
    /// Resume after the group's last committed offset (beginning if none).
    #[default]
    Committed,
    /// Start from the first event in the log.
    Beginning,
    /// Start after the last event currently in the log.
    End,
    /// Start at a specific offset.
    Offset(Offset),
}

/// A batch of events returned from polling, in log order.
#[derive(Debug)]
pub struct EventBatch<E> {
    events: Vec<(Offset, E)>,
}

impl<E> EventBatch<E> {
    pub fn new(events: Vec<(Offset, E)>) -> Self {
        Self { events }
    }

    pub fn empty() -> Self {
        Self { events: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first_offset(&self) -> Option<Offset> {
        self.events.first().map(|(o, _)| *o)
    }

    pub fn last_offset(&self) -> Option<Offset> {
        self.events.last().map(|(o, _)| *o)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Offset, E)> {
        self.events.iter()
    }
}

impl<E> IntoIterator for EventBatch<E> {
    type Item = (Offset, E);
    type IntoIter = std::vec::IntoIter<(Offset, E)>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

/// Append side of the log.
#[async_trait]
pub trait EventLog<E>: Send + Sync {
    /// Append one event, returning its offset.
    async fn append(&self, event: E) -> Result<Offset>;

    /// Append several events; returns the offset of the last one.
    async fn append_batch(&self, events: Vec<E>) -> Result<Option<Offset>>;

    /// Create a consumer for a group. The consumer starts after the group's
    /// last committed offset.
    async fn consumer(&self, group: &str) -> Result<Box<dyn EventConsumer<E>>>;

    /// Offset that the next appended event will receive.
    fn high_water_mark(&self) -> Offset;
}

/// Read side of the log with explicit offset commits.
#[async_trait]
pub trait EventConsumer<E>: Send {
    /// Poll up to `max_count` events, waiting at most `timeout` when the log
    /// has nothing new. Returns an empty batch on timeout and
    /// [`Error::Closed`](crate::Error::Closed) once a closed log is drained.
    async fn poll(&mut self, max_count: usize, timeout: Duration) -> Result<EventBatch<E>>;

    /// Record that every event up to and including `offset` has been handled.
    async fn commit(&mut self, offset: Offset) -> Result<()>;

    /// Move the read position.
    async fn seek(&mut self, position: SeekPosition) -> Result<()>;

    /// Last committed offset for this group, if any.
    fn committed_offset(&self) -> Option<Offset>;

    /// Consumer group name.
    fn group(&self) -> &str;
}
