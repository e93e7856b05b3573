//! Invokes the registered consumers for each notification of a batch.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use pgwatch_id::{ChannelSequences, SequenceId};
use thiserror::Error;
use tracing::{debug, warn};

use crate::batcher::Batch;
use crate::notification::{Notification, Origin};
use crate::registry::ConsumerRegistry;

/// A batch the dispatcher must not process. This is a bug in the caller, not a runtime condition.
#[derive(Debug, Error)]
pub enum ContractViolation {
    #[error("batch was dispatched before it was flushed")]
    UnsealedBatch,

    #[error("batch is empty")]
    EmptyBatch,

    #[error(
        "batch is out of order on channel {channel:?}: sequence id {next} follows {previous}"
    )]
    OutOfOrder {
        channel: String,
        previous: SequenceId,
        next: SequenceId,
    },
}

/// A consumer that returned an error or panicked
#[derive(Debug, Clone)]
pub struct ConsumerFailure {
    pub consumer_name: Arc<str>,
    pub notification: Notification,
    pub reason: String,
}

/// What happened to one notification of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationOutcome {
    pub channel: Arc<str>,
    pub sequence_id: Option<SequenceId>,
    pub origin: Origin,
    /// Consumers that handled the notification successfully
    pub succeeded: usize,
    /// Consumers that failed on the notification
    pub failed: usize,
}

impl NotificationOutcome {
    /// No consumer was registered for the channel
    pub fn is_unrouted(&self) -> bool {
        self.succeeded == 0 && self.failed == 0
    }
}

/// Per-notification and per-consumer outcomes of one dispatched batch
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<NotificationOutcome>,
    pub failures: Vec<ConsumerFailure>,
}

impl DispatchReport {
    pub fn notification_count(&self) -> usize {
        self.outcomes.len()
    }

    /// Successful consumer invocations
    pub fn delivered_count(&self) -> usize {
        self.outcomes.iter().map(|o| o.succeeded).sum()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn replayed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.origin == Origin::Replayed)
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// The highest dispatched sequence id per channel
    pub fn last_sequence_ids(&self) -> ChannelSequences {
        self.outcomes
            .iter()
            .filter_map(|o| o.sequence_id.map(|id| (o.channel.to_string(), id)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ConsumerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConsumerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// Invoke every matching consumer, one after the other, for each notification in arrival
    /// order. Consumer failures are recorded in the report and never interrupt the batch.
    pub async fn dispatch(&self, batch: Batch) -> Result<DispatchReport, ContractViolation> {
        validate(&batch)?;

        let mut report = DispatchReport {
            outcomes: Vec::with_capacity(batch.len()),
            failures: Vec::new(),
        };

        for notification in batch.notifications() {
            let mut outcome = NotificationOutcome {
                channel: notification.channel_arc(),
                sequence_id: notification.sequence_id(),
                origin: notification.origin(),
                succeeded: 0,
                failed: 0,
            };

            for registration in self.registry.lookup(notification.channel()) {
                let handled = AssertUnwindSafe(registration.handler().handle(notification))
                    .catch_unwind()
                    .await;
                let reason = match handled {
                    Ok(Ok(())) => {
                        outcome.succeeded += 1;
                        continue;
                    }
                    Ok(Err(e)) => format!("{e:#}"),
                    Err(panic) => format!("consumer panicked: {}", panic_message(&*panic)),
                };

                warn!(
                    consumer = registration.name(),
                    %notification,
                    %reason,
                    "consumer failed to handle notification"
                );
                outcome.failed += 1;
                report.failures.push(ConsumerFailure {
                    consumer_name: Arc::from(registration.name()),
                    notification: notification.clone(),
                    reason,
                });
            }

            if outcome.is_unrouted() {
                debug!(%notification, "no consumer registered for channel");
            }
            report.outcomes.push(outcome);
        }

        debug!(
            notifications = report.notification_count(),
            delivered = report.delivered_count(),
            failures = report.failure_count(),
            "dispatched batch"
        );
        Ok(report)
    }
}

fn validate(batch: &Batch) -> Result<(), ContractViolation> {
    if !batch.is_sealed() {
        return Err(ContractViolation::UnsealedBatch);
    }
    if batch.is_empty() {
        return Err(ContractViolation::EmptyBatch);
    }

    let mut last = ChannelSequences::new();
    for notification in batch.notifications() {
        let Some(next) = notification.sequence_id() else {
            continue;
        };
        let channel = notification.channel();
        if let Some(previous) = last.get(channel) {
            if next <= previous {
                return Err(ContractViolation::OutOfOrder {
                    channel: channel.to_string(),
                    previous,
                    next,
                });
            }
        }
        last.set(channel, next);
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
