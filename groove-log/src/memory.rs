//! In-memory EventLog implementation.
//!
//! Events live in a shared vector; every consumer reads the live log, so
//! appends made after a consumer was created are still delivered to it.
//! Committed offsets are kept per group on the log itself and survive the
//! consumer that wrote them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tracing::trace;

use crate::error::{Error, Result};
use crate::traits::{EventBatch, EventConsumer, EventLog, Offset, SeekPosition};

struct Shared<E> {
    events: RwLock<Vec<E>>,
    next_offset: AtomicU64,
    committed: RwLock<HashMap<String, Offset>>,
    appended: Notify,
    closed: AtomicBool,
}

/// In-process implementation of [`EventLog`].
pub struct InMemoryEventLog<E> {
    shared: Arc<Shared<E>>,
}

impl<E> InMemoryEventLog<E>
where
    E: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                events: RwLock::new(Vec::new()),
                next_offset: AtomicU64::new(0),
                committed: RwLock::new(HashMap::new()),
                appended: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.shared.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.events.read().await.is_empty()
    }

    /// Last committed offset for a group.
    pub async fn committed_offset(&self, group: &str) -> Option<Offset> {
        self.shared.committed.read().await.get(group).copied()
    }

    /// Stop accepting appends. Consumers can still drain what is stored.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.appended.notify_waiters();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl<E> Default for InMemoryEventLog<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E> EventLog<E> for InMemoryEventLog<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn append(&self, event: E) -> Result<Offset> {
        self.ensure_open()?;
        let offset = {
            let mut events = self.shared.events.write().await;
            events.push(event);
            let offset = (events.len() - 1) as Offset;
            self.shared.next_offset.store(offset + 1, Ordering::SeqCst);
            offset
        };
        self.shared.appended.notify_waiters();
        Ok(offset)
    }

    async fn append_batch(&self, batch: Vec<E>) -> Result<Option<Offset>> {
        self.ensure_open()?;
        if batch.is_empty() {
            return Ok(None);
        }
        let last = {
            let mut events = self.shared.events.write().await;
            events.extend(batch);
            let next = events.len() as Offset;
            self.shared.next_offset.store(next, Ordering::SeqCst);
            next - 1
        };
        self.shared.appended.notify_waiters();
        Ok(Some(last))
    }

    async fn consumer(&self, group: &str) -> Result<Box<dyn EventConsumer<E>>> {
        let committed = self.committed_offset(group).await;
        let position = committed.map_or(0, |o| o + 1);
        Ok(Box::new(InMemoryConsumer {
            group: group.to_string(),
            shared: Arc::clone(&self.shared),
            position,
            committed,
            delivered_up_to: committed,
        }))
    }

    fn high_water_mark(&self) -> Offset {
        self.shared.next_offset.load(Ordering::SeqCst)
    }
}

struct InMemoryConsumer<E> {
    group: String,
    shared: Arc<Shared<E>>,
    position: Offset,
    committed: Option<Offset>,
    delivered_up_to: Option<Offset>,
}

impl<E: Clone> InMemoryConsumer<E> {
    async fn take(&self, max_count: usize) -> Vec<(Offset, E)> {
        let events = self.shared.events.read().await;
        let start = self.position as usize;
        if start >= events.len() || max_count == 0 {
            return Vec::new();
        }
        let end = (start + max_count).min(events.len());
        events[start..end]
            .iter()
            .enumerate()
            .map(|(i, e)| ((start + i) as Offset, e.clone()))
            .collect()
    }
}

#[async_trait]
impl<E> EventConsumer<E> for InMemoryConsumer<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn poll(&mut self, max_count: usize, timeout: Duration) -> Result<EventBatch<E>> {
        // Register for wakeups before looking so an append in between is not lost.
        let shared = Arc::clone(&self.shared);
        let appended = shared.appended.notified();
        let mut events = self.take(max_count).await;

        if events.is_empty() {
            if shared.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            if tokio::time::timeout(timeout, appended).await.is_err() {
                return Ok(EventBatch::empty());
            }
            events = self.take(max_count).await;
            if events.is_empty() && shared.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
        }

        if let Some((last, _)) = events.last() {
            self.position = last + 1;
            self.delivered_up_to = Some(self.delivered_up_to.map_or(*last, |d| d.max(*last)));
            trace!(group = %self.group, count = events.len(), last_offset = last, "polled events");
        }

        Ok(EventBatch::new(events))
    }

    async fn commit(&mut self, offset: Offset) -> Result<()> {
        if self.delivered_up_to.is_none_or(|d| offset > d) {
            return Err(Error::CommitAhead {
                group: self.group.clone(),
                offset,
            });
        }
        self.committed = Some(offset);
        self.shared
            .committed
            .write()
            .await
            .insert(self.group.clone(), offset);
        Ok(())
    }

    async fn seek(&mut self, position: SeekPosition) -> Result<()> {
        let high_water_mark = self.shared.next_offset.load(Ordering::SeqCst);
        self.position = match position {
            SeekPosition::Committed => self.committed.map_or(0, |o| o + 1),
            SeekPosition::Beginning => 0,
            SeekPosition::End => high_water_mark,
            SeekPosition::Offset(offset) => {
                if offset > high_water_mark {
                    return Err(Error::OffsetOutOfRange {
                        offset,
                        high_water_mark,
                    });
                }
                offset
            }
        };
        Ok(())
    }

    fn committed_offset(&self) -> Option<Offset> {
        self.committed
    }

    fn group(&self) -> &str {
        &self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    async fn log_with(n: usize) -> InMemoryEventLog<String> {
        let log = InMemoryEventLog::new();
        for i in 0..n {
            log.append(format!("event-{i}")).await.unwrap();
        }
        log
    }

    #[tokio::test]
    async fn append_returns_incrementing_offsets() {
        let log: InMemoryEventLog<String> = InMemoryEventLog::new();
        assert_eq!(log.append("a".into()).await.unwrap(), 0);
        assert_eq!(log.append("b".into()).await.unwrap(), 1);
        assert_eq!(log.high_water_mark(), 2);
    }

    #[tokio::test]
    async fn append_batch_returns_last_offset() {
        let log: InMemoryEventLog<String> = InMemoryEventLog::new();
        let last = log
            .append_batch(vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(last, Some(2));
        assert_eq!(log.append_batch(vec![]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn consumer_respects_max_count_and_continues() {
        let log = log_with(10).await;
        let mut consumer = log.consumer("g").await.unwrap();

        let first = consumer.poll(3, SHORT).await.unwrap();
        assert_eq!(first.first_offset(), Some(0));
        assert_eq!(first.last_offset(), Some(2));

        let second = consumer.poll(3, SHORT).await.unwrap();
        assert_eq!(second.first_offset(), Some(3));
    }

    #[tokio::test]
    async fn consumer_sees_events_appended_after_creation() {
        let log = log_with(1).await;
        let mut consumer = log.consumer("g").await.unwrap();
        consumer.poll(10, SHORT).await.unwrap();

        log.append("late".into()).await.unwrap();
        let batch = consumer.poll(10, SHORT).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.first_offset(), Some(1));
    }

    #[tokio::test]
    async fn idle_poll_times_out_with_empty_batch() {
        let log: InMemoryEventLog<String> = InMemoryEventLog::new();
        let mut consumer = log.consumer("g").await.unwrap();
        let batch = consumer.poll(10, SHORT).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn recreated_consumer_resumes_after_commit() {
        let log = log_with(5).await;
        {
            let mut consumer = log.consumer("g").await.unwrap();
            let batch = consumer.poll(2, SHORT).await.unwrap();
            consumer.commit(batch.last_offset().unwrap()).await.unwrap();
        }

        let mut consumer = log.consumer("g").await.unwrap();
        assert_eq!(consumer.committed_offset(), Some(1));
        let batch = consumer.poll(10, SHORT).await.unwrap();
        assert_eq!(batch.first_offset(), Some(2));
    }

    #[tokio::test]
    async fn uncommitted_events_are_redelivered() {
        let log = log_with(3).await;
        {
            let mut consumer = log.consumer("g").await.unwrap();
            consumer.poll(3, SHORT).await.unwrap();
        }
        let mut consumer = log.consumer("g").await.unwrap();
        let batch = consumer.poll(10, SHORT).await.unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn commit_beyond_delivered_is_rejected() {
        let log = log_with(3).await;
        let mut consumer = log.consumer("g").await.unwrap();
        consumer.poll(1, SHORT).await.unwrap();
        assert!(matches!(
            consumer.commit(2).await,
            Err(Error::CommitAhead { .. })
        ));
    }

    #[tokio::test]
    async fn seek_positions() {
        let log = log_with(5).await;
        let mut consumer = log.consumer("g").await.unwrap();

        consumer.seek(SeekPosition::End).await.unwrap();
        assert!(consumer.poll(10, SHORT).await.unwrap().is_empty());

        consumer.seek(SeekPosition::Offset(3)).await.unwrap();
        assert_eq!(consumer.poll(10, SHORT).await.unwrap().first_offset(), Some(3));

        consumer.seek(SeekPosition::Beginning).await.unwrap();
        assert_eq!(consumer.poll(1, SHORT).await.unwrap().first_offset(), Some(0));

        assert!(matches!(
            consumer.seek(SeekPosition::Offset(99)).await,
            Err(Error::OffsetOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn independent_consumer_groups() {
        let log = log_with(5).await;
        let mut a = log.consumer("a").await.unwrap();
        let mut b = log.consumer("b").await.unwrap();

        let batch_a = a.poll(3, SHORT).await.unwrap();
        a.commit(batch_a.last_offset().unwrap()).await.unwrap();

        let batch_b = b.poll(2, SHORT).await.unwrap();
        assert_eq!(batch_b.first_offset(), Some(0));
        assert_eq!(log.committed_offset("a").await, Some(2));
        assert_eq!(log.committed_offset("b").await, None);
    }

    #[tokio::test]
    async fn closed_log_rejects_appends() {
        let log = log_with(1).await;
        log.close();
        assert!(matches!(log.append("x".into()).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn closed_log_drains_then_reports_closed() {
        let log = log_with(2).await;
        let mut consumer = log.consumer("g").await.unwrap();
        log.close();

        let batch = consumer.poll(10, SHORT).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(matches!(consumer.poll(10, SHORT).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn close_wakes_a_waiting_poll() {
        let log = InMemoryEventLog::<String>::new();
        let mut consumer = log.consumer("g").await.unwrap();

        let waiter = tokio::spawn(async move { consumer.poll(10, Duration::from_secs(30)).await });
        tokio::time::sleep(SHORT).await;
        log.close();

        let polled = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(polled, Err(Error::Closed)));
    }
}
