//! Counters describing what a listener has done so far.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::dispatcher::DispatchReport;

/// Lock-free counters shared between a listener and whoever observes it.
///
/// Updates use `Relaxed` ordering; a [`snapshot`][ListenerMetrics::snapshot] is consistent enough
/// for monitoring but not a point-in-time view.
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    received: AtomicU64,
    decode_errors: AtomicU64,
    replayed: AtomicU64,
    gaps: AtomicU64,
    duplicates: AtomicU64,
    reconnects: AtomicU64,
    replay_failures: AtomicU64,
    batches: AtomicU64,
    dispatched: AtomicU64,
    delivered: AtomicU64,
    consumer_failures: AtomicU64,
}

/// A copy of the counters of a [`ListenerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Payloads read from the live connection
    pub received: u64,
    /// Payloads dropped because they could not be decoded
    pub decode_errors: u64,
    /// Notifications recovered from the replay store
    pub replayed: u64,
    /// Sequence gaps detected on the live connection
    pub gaps: u64,
    /// Notifications dropped because their sequence id was not new.
    ///
    /// Live copies of notifications already delivered by a replay are not counted.
    pub duplicates: u64,
    pub reconnects: u64,
    /// Replay queries abandoned after exhausting their attempts
    pub replay_failures: u64,
    pub batches: u64,
    /// Notifications that went through the dispatcher
    pub dispatched: u64,
    /// Successful consumer invocations
    pub delivered: u64,
    pub consumer_failures: u64,
}

impl ListenerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replayed(&self, n: u64) {
        self.replayed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_gap(&self) {
        self.gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replay_failure(&self) {
        self.replay_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self, report: &DispatchReport) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.dispatched
            .fetch_add(report.notification_count() as u64, Ordering::Relaxed);
        self.delivered
            .fetch_add(report.delivered_count() as u64, Ordering::Relaxed);
        self.consumer_failures
            .fetch_add(report.failure_count() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            replay_failures: self.replay_failures.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            consumer_failures: self.consumer_failures.load(Ordering::Relaxed),
        }
    }
}
