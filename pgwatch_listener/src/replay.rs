//! Recovery of notifications missed while disconnected or dropped by the live connection.

use std::fmt::Debug;

use async_trait::async_trait;
use pgwatch_id::SequenceId;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::subscription::RawPayload;

pub const DEFAULT_REPLAY_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
#[error("replay store query for channel {channel:?} failed: {reason}")]
pub struct ReplayStoreError {
    pub channel: String,
    pub reason: String,
}

/// A durable side-store, typically an outbox table written by the same trigger that emits the
/// live notification.
#[async_trait]
pub trait ReplayStore: Debug + Send + Sync + 'static {
    /// All payloads on `channel` with a sequence id greater than `after`, in sequence order.
    /// Bodies must use the same envelope as live payloads.
    async fn fetch_since(
        &self,
        channel: &str,
        after: SequenceId,
    ) -> Result<Vec<RawPayload>, ReplayStoreError>;
}

/// Query `store`, retrying with backoff up to `max_attempts` times.
///
/// Returns `None` when the attempts are exhausted or `stop` fires. The caller then proceeds with
/// live reads; whatever the store held for this range is not delivered.
pub(crate) async fn fetch_with_retry(
    store: &dyn ReplayStore,
    channel: &str,
    after: SequenceId,
    max_attempts: u32,
    backoff: BackoffConfig,
    stop: &CancellationToken,
) -> Option<Vec<RawPayload>> {
    let mut backoff = Backoff::new(backoff);
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match store.fetch_since(channel, after).await {
            Ok(payloads) => {
                debug!(%channel, %after, count = payloads.len(), "fetched replay");
                return Some(payloads);
            }
            Err(e) if attempt == max_attempts => {
                error!(
                    %channel,
                    %after,
                    attempts = attempt,
                    error = %e,
                    "giving up on replay, notifications after this sequence id may be lost (possible data loss)"
                );
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(%channel, %after, attempt, ?delay, error = %e, "replay query failed, retrying");
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(%channel, "stop requested while retrying replay");
                        return None;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    None
}
