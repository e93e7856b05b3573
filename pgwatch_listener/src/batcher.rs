//! Accumulates notifications into batches flushed by size, age or on request.

use std::time::Duration;

use tokio::time::Instant;

use crate::notification::Notification;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// An ordered group of notifications handed to the dispatcher in one piece.
///
/// A batch is sealed when it is flushed; the dispatcher only accepts sealed batches.
#[derive(Debug)]
pub struct Batch {
    notifications: Vec<Notification>,
    opened_at: Instant,
    flushed_at: Option<Instant>,
}

impl Batch {
    fn open_at(opened_at: Instant) -> Self {
        Self {
            notifications: Vec::new(),
            opened_at,
            flushed_at: None,
        }
    }

    /// A sealed batch holding `notifications` in the given order
    pub fn from_notifications(notifications: Vec<Notification>) -> Self {
        let now = Instant::now();
        Self {
            notifications,
            opened_at: now,
            flushed_at: Some(now),
        }
    }

    #[cfg(test)]
    pub(crate) fn unsealed(notifications: Vec<Notification>) -> Self {
        Self {
            notifications,
            ..Self::open_at(Instant::now())
        }
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn into_notifications(self) -> Vec<Notification> {
        self.notifications
    }

    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn flushed_at(&self) -> Option<Instant> {
        self.flushed_at
    }

    pub fn is_sealed(&self) -> bool {
        self.flushed_at.is_some()
    }
}

/// Owns at most one open [`Batch`].
///
/// A batch is opened by the first notification offered to an idle batcher, and flushed when it
/// reaches `max_batch_size`, when it is older than `max_batch_age`, or on
/// [`force_flush`][Batcher::force_flush]. Age is only checked when the batcher is touched, so the
/// owner polls [`poll_expired`][Batcher::poll_expired] at [`deadline`][Batcher::deadline].
#[derive(Debug)]
pub struct Batcher {
    max_batch_size: usize,
    max_batch_age: Duration,
    open: Option<Batch>,
}

impl Batcher {
    pub fn new(max_batch_size: usize, max_batch_age: Duration) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            max_batch_age,
            open: None,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_batch_age(&self) -> Duration {
        self.max_batch_age
    }

    /// Add a notification to the open batch.
    ///
    /// Returns a completed batch if one was flushed. If the open batch had already expired it is
    /// returned and `notification` starts the next batch; otherwise `notification` is appended
    /// and the batch is returned if that made it full.
    pub fn offer(&mut self, notification: Notification) -> Option<Batch> {
        let now = Instant::now();
        let expired = self.flush_if_expired(now);

        let batch = self.open.get_or_insert_with(|| Batch::open_at(now));
        batch.notifications.push(notification);

        // an expired batch held fewer than max_batch_size entries, so max_batch_size is at least
        // 2 and the fresh batch cannot be full yet
        if expired.is_some() {
            return expired;
        }
        if batch.len() >= self.max_batch_size {
            return self.flush(now);
        }
        None
    }

    /// Flush the open batch if it has reached `max_batch_age`
    pub fn poll_expired(&mut self) -> Option<Batch> {
        self.flush_if_expired(Instant::now())
    }

    /// When the open batch expires, if there is one
    pub fn deadline(&self) -> Option<Instant> {
        self.open
            .as_ref()
            .map(|batch| batch.opened_at + self.max_batch_age)
    }

    pub fn force_flush(&mut self) -> Option<Batch> {
        self.flush(Instant::now())
    }

    /// Number of notifications in the open batch
    pub fn pending(&self) -> usize {
        self.open.as_ref().map_or(0, Batch::len)
    }

    fn flush_if_expired(&mut self, now: Instant) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.flush(now),
            _ => None,
        }
    }

    fn flush(&mut self, now: Instant) -> Option<Batch> {
        let mut batch = self.open.take()?;
        batch.flushed_at = Some(now);
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Payload;
    use pgwatch_id::SequenceId;

    fn notification(id: u64) -> Notification {
        Notification::new("orders", Payload::new()).with_sequence_id(Some(SequenceId::new(id)))
    }

    fn ids(batch: &Batch) -> Vec<u64> {
        batch
            .notifications()
            .iter()
            .filter_map(|n| n.sequence_id().map(|id| id.as_u64()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_when_full() {
        let mut batcher = Batcher::new(3, Duration::from_secs(30));
        assert!(batcher.offer(notification(1)).is_none());
        assert!(batcher.offer(notification(2)).is_none());
        let batch = batcher.offer(notification(3)).expect("batch is full");
        assert_eq!(ids(&batch), vec![1, 2, 3]);
        assert!(batch.is_sealed());
        assert_eq!(batcher.pending(), 0);
        assert!(batcher.deadline().is_none());
        assert!(batcher.force_flush().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_when_old() {
        let mut batcher = Batcher::new(DEFAULT_MAX_BATCH_SIZE, Duration::from_secs(1));
        assert!(batcher.offer(notification(1)).is_none());
        assert!(batcher.poll_expired().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let batch = batcher.poll_expired().expect("batch is old enough");
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch.flushed_at().unwrap() - batch.opened_at(),
            Duration::from_secs(1)
        );
        assert!(batcher.poll_expired().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_batch_is_returned_and_offer_starts_the_next() {
        let mut batcher = Batcher::new(10, Duration::from_millis(100));
        batcher.offer(notification(1));
        batcher.offer(notification(2));
        tokio::time::advance(Duration::from_millis(150)).await;

        let batch = batcher.offer(notification(3)).expect("expired batch");
        assert_eq!(ids(&batch), vec![1, 2]);
        assert_eq!(batcher.pending(), 1);
        assert_eq!(ids(&batcher.force_flush().unwrap()), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn size_of_one_flushes_every_offer() {
        let mut batcher = Batcher::new(0, Duration::from_secs(1));
        assert_eq!(batcher.max_batch_size(), 1);
        for id in 1..=3 {
            let batch = batcher.offer(notification(id)).unwrap();
            assert_eq!(ids(&batch), vec![id]);
        }
    }
}
