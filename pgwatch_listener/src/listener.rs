//! The listener loop: owns the subscription connection and drives decode, batch and dispatch.
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> (Reading <-> Reconnecting) -> ShuttingDown -> Stopped
//! ```
//!
//! The loop is the only writer of per-channel sequence state. Dispatch runs on a separate task so
//! that slow consumers do not hold up reads, with at most one batch in flight at a time.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use pgwatch_id::{ChannelSequences, SequenceId};
use pgwatch_shutdown::ShutdownToken;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::batcher::{Batch, Batcher, DEFAULT_MAX_BATCH_SIZE};
use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::decoder::{DEFAULT_MAX_PAYLOAD_SIZE, Decoder};
use crate::dispatcher::{ContractViolation, DispatchReport, Dispatcher};
use crate::metrics::{ListenerMetrics, MetricsSnapshot};
use crate::notification::Notification;
use crate::registry::{ConsumerRegistry, RegistryError};
use crate::replay::{DEFAULT_REPLAY_MAX_ATTEMPTS, ReplayStore, fetch_with_retry};
use crate::subscription::{ConnectionError, RawPayload, Subscription, SubscriptionSource};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive failed connection attempts logged as warnings before switching to errors
const ESCALATE_AFTER_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Channels to subscribe to in addition to those named by the registered consumers
    pub channels: Vec<String>,
    pub max_batch_size: usize,
    /// Defaults to `read_timeout` when unset
    pub max_batch_age: Option<Duration>,
    pub read_timeout: Duration,
    pub backoff: BackoffConfig,
    pub replay_max_attempts: u32,
    pub max_payload_size: usize,
    /// Names of the consumers to activate; empty activates every registered consumer
    pub consumers: Vec<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_age: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            backoff: BackoffConfig::default(),
            replay_max_attempts: DEFAULT_REPLAY_MAX_ATTEMPTS,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            consumers: Vec::new(),
        }
    }
}

impl ListenerConfig {
    pub fn batch_age(&self) -> Duration {
        self.max_batch_age.unwrap_or(self.read_timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Subscribed,
    Reading,
    Reconnecting,
    ShuttingDown,
    Stopped,
}

impl Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Reading => "reading",
            Self::Reconnecting => "reconnecting",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Fatal outcomes of a listener run. Everything else is recovered from inside the loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("dispatcher contract violated: {0}")]
    ContractViolation(#[from] ContractViolation),

    #[error("dispatch worker terminated unexpectedly")]
    DispatchWorkerTerminated,

    #[error("listener task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A configured listener, ready to [`run`][ListenerLoop::run] or [`spawn`][ListenerLoop::spawn].
#[derive(Debug)]
pub struct ListenerLoop {
    config: ListenerConfig,
    source: Arc<dyn SubscriptionSource>,
    replay_store: Arc<dyn ReplayStore>,
    registry: Arc<ConsumerRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    metrics: Arc<ListenerMetrics>,
    state: watch::Sender<ListenerState>,
    stop: CancellationToken,
    shutdown: Option<ShutdownToken>,
}

impl ListenerLoop {
    /// Set up a listener over `registry`, narrowed to the consumers named in `config.consumers`
    pub fn new(
        config: ListenerConfig,
        source: Arc<dyn SubscriptionSource>,
        replay_store: Arc<dyn ReplayStore>,
        mut registry: ConsumerRegistry,
    ) -> Result<Self, RegistryError> {
        registry.select(&config.consumers)?;
        let (state, _) = watch::channel(ListenerState::Disconnected);
        Ok(Self {
            config,
            source,
            replay_store,
            registry: Arc::new(registry),
            checkpoints: Arc::new(InMemoryCheckpointStore::default()),
            metrics: Default::default(),
            state,
            stop: CancellationToken::new(),
            shutdown: None,
        })
    }

    pub fn with_checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Stop with the process, and report completion to its [`ShutdownManager`]
    ///
    /// [`ShutdownManager`]: pgwatch_shutdown::ShutdownManager
    pub fn with_shutdown_token(mut self, token: ShutdownToken) -> Self {
        self.stop = token.child_token();
        self.shutdown = Some(token);
        self
    }

    /// Cancelling the token stops this listener
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn metrics(&self) -> Arc<ListenerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// Run until stopped, or until a fatal error
    pub async fn run(self) -> Result<()> {
        Runner::new(self).run().await
    }

    pub fn spawn(self) -> ListenerHandle {
        let stop = self.stop.clone();
        let state = self.state.subscribe();
        let metrics = Arc::clone(&self.metrics);
        let task = tokio::spawn(self.run());
        ListenerHandle {
            stop,
            state,
            metrics,
            task,
        }
    }
}

/// A listener running on its own task
#[derive(Debug)]
pub struct ListenerHandle {
    stop: CancellationToken,
    state: watch::Receiver<ListenerState>,
    metrics: Arc<ListenerMetrics>,
    task: JoinHandle<Result<()>>,
}

impl ListenerHandle {
    /// Ask the listener to shut down. Returns immediately; use [`join`][Self::join] to wait.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Wait until the listener enters `target`. Returns `false` if it stopped without doing so.
    pub async fn wait_for_state(&self, target: ListenerState) -> bool {
        let mut state = self.state.clone();
        state.wait_for(|s| *s == target).await.is_ok()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn join(self) -> Result<()> {
        self.task.await?
    }

    /// [`stop`][Self::stop] followed by [`join`][Self::join]
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.join().await
    }
}

type DispatchResult = Result<DispatchReport, ContractViolation>;

#[derive(Debug)]
struct DispatchJob {
    batch: Batch,
    done: oneshot::Sender<DispatchResult>,
}

/// Runs the dispatcher on its own task, one batch at a time
#[derive(Debug)]
struct DispatchWorker {
    jobs: Option<mpsc::Sender<DispatchJob>>,
    in_flight: Option<oneshot::Receiver<DispatchResult>>,
    task: Option<JoinHandle<()>>,
}

impl DispatchWorker {
    fn spawn(dispatcher: Dispatcher) -> Self {
        let (tx, mut rx) = mpsc::channel::<DispatchJob>(1);
        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = dispatcher.dispatch(job.batch).await;
                // the listener gave up on this batch, nothing left to report to
                let _ = job.done.send(result);
            }
            debug!("dispatch worker stopped");
        });
        Self {
            jobs: Some(tx),
            in_flight: None,
            task: Some(task),
        }
    }

    async fn shutdown(&mut self) {
        self.jobs.take();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "dispatch worker failed");
            }
        }
    }
}

async fn wait_in_flight(
    in_flight: &mut Option<oneshot::Receiver<DispatchResult>>,
) -> Result<DispatchResult, oneshot::error::RecvError> {
    match in_flight {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

#[derive(Debug)]
enum SequenceCheck {
    /// The notification carries no sequence id
    Untracked,
    /// First sequence id seen on the channel
    First,
    Next,
    /// Not greater than the last sequence id seen on the channel
    Stale { last: SequenceId },
    Gap { last: SequenceId, next: SequenceId },
}

/// Last sequence id per channel: `observed` when accepted into a batch, `committed` once the
/// batch holding it was dispatched.
#[derive(Debug, Default)]
struct SequenceTracker {
    observed: ChannelSequences,
    committed: ChannelSequences,
}

impl SequenceTracker {
    fn check(&self, notification: &Notification) -> SequenceCheck {
        let Some(id) = notification.sequence_id() else {
            return SequenceCheck::Untracked;
        };
        match self.observed.get(notification.channel()) {
            None => SequenceCheck::First,
            Some(last) if id.is_successor_of(last) => SequenceCheck::Next,
            Some(last) if id <= last => SequenceCheck::Stale { last },
            Some(last) => SequenceCheck::Gap { last, next: id },
        }
    }

    fn observe(&mut self, notification: &Notification) {
        if let Some(id) = notification.sequence_id() {
            self.observed.advance(notification.channel(), id);
        }
    }

    fn commit(&mut self, dispatched: &ChannelSequences) -> bool {
        let before = self.committed.clone();
        self.committed.merge(dispatched);
        before != self.committed
    }

    /// Forget everything accepted but not dispatched
    fn rewind(&mut self) {
        self.observed = self.committed.clone();
    }
}

enum ReadOutcome {
    Stop,
    Lost(ConnectionError),
}

enum ReadEvent {
    Dispatched(Result<DispatchResult, oneshot::error::RecvError>),
    Read(Result<Option<RawPayload>, ConnectionError>),
}

/// The state of one [`ListenerLoop::run`]
#[derive(Debug)]
struct Runner {
    config: ListenerConfig,
    source: Arc<dyn SubscriptionSource>,
    replay_store: Arc<dyn ReplayStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    metrics: Arc<ListenerMetrics>,
    state: watch::Sender<ListenerState>,
    stop: CancellationToken,
    shutdown: Option<ShutdownToken>,
    channels: Vec<Arc<str>>,
    decoder: Decoder,
    batcher: Batcher,
    sequences: SequenceTracker,
    /// Highest id per channel accepted from the replay store on the current connection
    replayed: ChannelSequences,
    worker: DispatchWorker,
}

impl Runner {
    fn new(listener: ListenerLoop) -> Self {
        let ListenerLoop {
            config,
            source,
            replay_store,
            registry,
            checkpoints,
            metrics,
            state,
            stop,
            shutdown,
        } = listener;

        let mut channels = registry.channels();
        for channel in &config.channels {
            if !channel.is_empty() && !channels.iter().any(|c| c.as_ref() == channel) {
                channels.push(Arc::from(channel.as_str()));
            }
        }

        Self {
            decoder: Decoder::new(config.max_payload_size),
            batcher: Batcher::new(config.max_batch_size, config.batch_age()),
            worker: DispatchWorker::spawn(Dispatcher::new(registry)),
            sequences: SequenceTracker::default(),
            replayed: ChannelSequences::new(),
            channels,
            config,
            source,
            replay_store,
            checkpoints,
            metrics,
            state,
            stop,
            shutdown,
        }
    }

    fn set_state(&self, state: ListenerState) {
        let changed = self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        if changed {
            debug!(%state, "listener state changed");
        }
    }

    async fn run(mut self) -> Result<()> {
        if self.channels.is_empty() {
            warn!("no channels to subscribe to, the listener will not receive notifications");
        }
        self.load_checkpoints().await;

        let result = self.run_until_stopped().await;
        self.worker.shutdown().await;

        self.set_state(ListenerState::Stopped);
        match &result {
            Ok(()) => info!("listener stopped"),
            Err(e) => {
                error!(error = %e, "listener stopped on a fatal error");
                if let Some(token) = &self.shutdown {
                    token.trigger_shutdown();
                }
            }
        }
        if let Some(token) = &self.shutdown {
            token.complete();
        }
        result
    }

    async fn run_until_stopped(&mut self) -> Result<()> {
        let mut backoff = Backoff::new(self.config.backoff);
        loop {
            let Some(mut subscription) = self.connect_with_backoff(&mut backoff).await else {
                return self.shut_down(None).await;
            };

            self.set_state(ListenerState::Subscribed);
            backoff.reset();
            self.replayed = ChannelSequences::new();
            if let Err(e) = self.replay_subscribed().await {
                subscription.close().await;
                return Err(e);
            }

            match self.read_loop(subscription.as_mut()).await {
                Ok(ReadOutcome::Stop) => return self.shut_down(Some(subscription)).await,
                Ok(ReadOutcome::Lost(e)) => {
                    self.set_state(ListenerState::Reconnecting);
                    self.metrics.record_reconnect();
                    warn!(error = %e, "lost subscription connection, reconnecting");

                    let drained = self.flush_and_drain().await;
                    subscription.close().await;
                    drained?;
                    self.sequences.rewind();

                    self.set_state(ListenerState::Disconnected);
                    if !self.sleep_unless_stopped(backoff.next_delay()).await {
                        return self.shut_down(None).await;
                    }
                }
                Err(e) => {
                    subscription.close().await;
                    return Err(e);
                }
            }
        }
    }

    async fn load_checkpoints(&mut self) {
        match self.checkpoints.load().await {
            Ok(checkpoints) => {
                if !checkpoints.is_empty() {
                    info!(channels = checkpoints.len(), "loaded checkpoints");
                }
                self.sequences.committed = checkpoints;
                self.sequences.rewind();
            }
            Err(e) => error!(
                error = %e,
                "failed to load checkpoints, notifications missed before this start will not be replayed"
            ),
        }
    }

    /// Returns `false` if stopped during the sleep
    async fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Connect and subscribe, retrying until it works or the listener is stopped
    async fn connect_with_backoff(
        &mut self,
        backoff: &mut Backoff,
    ) -> Option<Box<dyn Subscription>> {
        loop {
            if self.stop.is_cancelled() {
                return None;
            }
            self.set_state(ListenerState::Connecting);
            match self.connect_and_subscribe().await {
                Ok(subscription) => return Some(subscription),
                Err(e) => {
                    let delay = backoff.next_delay();
                    let attempts = backoff.attempts();
                    if attempts > ESCALATE_AFTER_ATTEMPTS {
                        error!(error = %e, attempts, ?delay, "still unable to connect, retrying");
                    } else {
                        warn!(error = %e, attempts, ?delay, "failed to connect, retrying");
                    }
                    self.set_state(ListenerState::Disconnected);
                    if !self.sleep_unless_stopped(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn connect_and_subscribe(&self) -> Result<Box<dyn Subscription>, ConnectionError> {
        let mut subscription = self.source.connect().await?;
        for channel in &self.channels {
            if let Err(e) = subscription.subscribe(channel).await {
                subscription.close().await;
                return Err(e);
            }
        }
        info!(channels = ?self.channels, "subscribed");
        Ok(subscription)
    }

    /// Replay every subscribed channel from its last dispatched sequence id
    async fn replay_subscribed(&mut self) -> Result<()> {
        for channel in self.channels.clone() {
            if let Some(last) = self.sequences.observed.get(&channel) {
                self.replay(&channel, last, None).await?;
            }
        }
        Ok(())
    }

    /// Feed notifications with a sequence id in `(after, before)` from the replay store
    async fn replay(
        &mut self,
        channel: &str,
        after: SequenceId,
        before: Option<SequenceId>,
    ) -> Result<()> {
        let Some(payloads) = fetch_with_retry(
            self.replay_store.as_ref(),
            channel,
            after,
            self.config.replay_max_attempts,
            self.config.backoff,
            &self.stop,
        )
        .await
        else {
            self.metrics.record_replay_failure();
            return Ok(());
        };

        let mut replayed = 0;
        for raw in payloads {
            let notification = match self.decoder.decode_replayed(&raw) {
                Ok(n) => n,
                Err(e) => {
                    self.metrics.record_decode_error();
                    warn!(error = %e, "dropping undecodable replayed notification");
                    continue;
                }
            };
            if notification.channel() != channel {
                warn!(%channel, %notification, "replay store returned a notification for another channel");
                continue;
            }
            let Some(id) = notification.sequence_id() else {
                warn!(%channel, "replay store returned a notification without sequence id");
                continue;
            };
            if before.is_some_and(|before| id >= before) {
                break;
            }

            match self.sequences.check(&notification) {
                SequenceCheck::Stale { .. } => {
                    debug!(%notification, "already delivered, skipping replayed notification");
                    continue;
                }
                SequenceCheck::Gap { last, next } => warn!(
                    %channel,
                    %last,
                    %next,
                    missing = next.missing_since(last),
                    "replay store is missing notifications"
                ),
                SequenceCheck::Untracked | SequenceCheck::First | SequenceCheck::Next => {}
            }

            replayed += 1;
            self.replayed.advance(channel, id);
            self.accept(notification).await?;
        }

        self.metrics.record_replayed(replayed);
        if replayed > 0 {
            info!(%channel, %after, count = replayed, "replayed notifications");
        }
        Ok(())
    }

    async fn read_loop(&mut self, subscription: &mut dyn Subscription) -> Result<ReadOutcome> {
        loop {
            if let Some(batch) = self.batcher.poll_expired() {
                self.submit(batch).await?;
            }
            self.set_state(ListenerState::Reading);

            let wait = match self.batcher.deadline() {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.config.read_timeout),
                None => self.config.read_timeout,
            };

            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(ReadOutcome::Stop),
                done = wait_in_flight(&mut self.worker.in_flight),
                    if self.worker.in_flight.is_some() => ReadEvent::Dispatched(done),
                read = subscription.read_next(wait) => ReadEvent::Read(read),
            };

            match event {
                ReadEvent::Dispatched(done) => {
                    self.worker.in_flight = None;
                    let report = done.map_err(|_| Error::DispatchWorkerTerminated)??;
                    self.commit(report).await;
                }
                ReadEvent::Read(Ok(Some(raw))) => self.ingest(raw).await?,
                ReadEvent::Read(Ok(None)) => {
                    if let Some(batch) = self.batcher.force_flush() {
                        debug!(size = batch.len(), "read timed out, flushing open batch");
                        self.submit(batch).await?;
                    }
                }
                ReadEvent::Read(Err(e)) => return Ok(ReadOutcome::Lost(e)),
            }
        }
    }

    /// Handle one payload from the live connection
    async fn ingest(&mut self, raw: RawPayload) -> Result<()> {
        self.metrics.record_received();
        let notification = match self.decoder.decode(&raw) {
            Ok(n) => n,
            Err(e) => {
                self.metrics.record_decode_error();
                warn!(error = %e, "dropping undecodable notification");
                return Ok(());
            }
        };

        match self.sequences.check(&notification) {
            SequenceCheck::Untracked | SequenceCheck::First | SequenceCheck::Next => {}
            SequenceCheck::Stale { last } if self.was_replayed(&notification) => {
                // notified while the replay query ran
                debug!(%notification, %last, "already replayed, skipping live notification");
                return Ok(());
            }
            SequenceCheck::Stale { last } => {
                self.metrics.record_duplicate();
                warn!(
                    %notification,
                    %last,
                    "dropping notification with a sequence id that was already seen"
                );
                return Ok(());
            }
            SequenceCheck::Gap { last, next } => {
                let channel = notification.channel_arc();
                self.metrics.record_gap();
                warn!(
                    %channel,
                    %last,
                    received = %next,
                    missing = next.missing_since(last),
                    "sequence gap detected, querying replay store"
                );
                self.replay(&channel, last, Some(next)).await?;
            }
        }

        self.accept(notification).await
    }

    fn was_replayed(&self, notification: &Notification) -> bool {
        match (
            notification.sequence_id(),
            self.replayed.get(notification.channel()),
        ) {
            (Some(id), Some(through)) => id <= through,
            _ => false,
        }
    }

    async fn accept(&mut self, notification: Notification) -> Result<()> {
        self.sequences.observe(&notification);
        if let Some(batch) = self.batcher.offer(notification) {
            self.submit(batch).await?;
        }
        Ok(())
    }

    /// Hand a batch to the dispatch worker once the previous one has completed
    async fn submit(&mut self, batch: Batch) -> Result<()> {
        self.drain().await?;
        let (done, rx) = oneshot::channel();
        let jobs = self
            .worker
            .jobs
            .as_ref()
            .ok_or(Error::DispatchWorkerTerminated)?;
        jobs.send(DispatchJob { batch, done })
            .await
            .map_err(|_| Error::DispatchWorkerTerminated)?;
        self.worker.in_flight = Some(rx);
        Ok(())
    }

    /// Wait for the batch in flight, if any
    async fn drain(&mut self) -> Result<()> {
        if let Some(rx) = self.worker.in_flight.take() {
            let report = rx.await.map_err(|_| Error::DispatchWorkerTerminated)??;
            self.commit(report).await;
        }
        Ok(())
    }

    async fn flush_and_drain(&mut self) -> Result<()> {
        if let Some(batch) = self.batcher.force_flush() {
            self.submit(batch).await?;
        }
        self.drain().await
    }

    async fn commit(&mut self, report: DispatchReport) {
        self.metrics.record_dispatch(&report);
        if !report.is_success() {
            warn!(
                notifications = report.notification_count(),
                failures = report.failure_count(),
                "batch dispatched with consumer failures"
            );
        }

        if self.sequences.commit(&report.last_sequence_ids()) {
            if let Err(e) = self.checkpoints.save(&self.sequences.committed).await {
                warn!(error = %e, "failed to save checkpoints");
            }
        }
    }

    async fn shut_down(&mut self, subscription: Option<Box<dyn Subscription>>) -> Result<()> {
        self.set_state(ListenerState::ShuttingDown);
        info!("listener shutting down");

        let drained = self.flush_and_drain().await;
        if let Some(mut subscription) = subscription {
            for channel in &self.channels {
                if let Err(e) = subscription.unsubscribe(channel).await {
                    debug!(%channel, error = %e, "failed to unsubscribe");
                }
            }
            subscription.close().await;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{Origin, Payload};

    fn notification(channel: &str, id: Option<u64>) -> Notification {
        Notification::new(channel, Payload::new()).with_sequence_id(id.map(SequenceId::new))
    }

    #[test]
    fn sequence_checks() {
        let mut tracker = SequenceTracker::default();
        assert!(matches!(
            tracker.check(&notification("orders", None)),
            SequenceCheck::Untracked
        ));
        assert!(matches!(
            tracker.check(&notification("orders", Some(7))),
            SequenceCheck::First
        ));
        tracker.observe(&notification("orders", Some(7)));

        assert!(matches!(
            tracker.check(&notification("orders", Some(8))),
            SequenceCheck::Next
        ));
        assert!(matches!(
            tracker.check(&notification("orders", Some(7))),
            SequenceCheck::Stale { .. }
        ));
        assert!(matches!(
            tracker.check(&notification("orders", Some(3))),
            SequenceCheck::Stale { .. }
        ));
        assert!(matches!(
            tracker.check(&notification("orders", Some(10))),
            SequenceCheck::Gap { last, next }
                if last == SequenceId::new(7) && next == SequenceId::new(10)
        ));
        assert!(matches!(
            tracker.check(&notification("users", Some(10))),
            SequenceCheck::First
        ));
    }

    #[test]
    fn rewind_returns_to_committed() {
        let mut tracker = SequenceTracker::default();
        tracker.observe(&notification("orders", Some(1)));
        tracker.observe(&notification("orders", Some(2)));
        let dispatched: ChannelSequences = [("orders", SequenceId::new(1))].into_iter().collect();
        assert!(tracker.commit(&dispatched));
        assert!(!tracker.commit(&dispatched));

        tracker.rewind();
        assert_eq!(tracker.observed.get("orders"), Some(SequenceId::new(1)));
        let replayed = notification("orders", Some(2)).with_origin(Origin::Replayed);
        assert!(matches!(tracker.check(&replayed), SequenceCheck::Next));
    }

    #[test]
    fn batch_age_defaults_to_read_timeout() {
        let mut config = ListenerConfig {
            read_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(config.batch_age(), Duration::from_secs(5));
        config.max_batch_age = Some(Duration::from_millis(250));
        assert_eq!(config.batch_age(), Duration::from_millis(250));
        assert_eq!(config.max_batch_size, 50);
        assert_eq!(config.max_payload_size, 8 * 1024);
    }
}
