//! Application-supplied notification handlers.

use std::fmt::Debug;

use async_trait::async_trait;
use tracing::info;

use crate::notification::Notification;

/// A handler invoked once per matching notification.
///
/// Handlers are called sequentially, never concurrently with themselves within one listener.
/// Returning an error or panicking is recorded as a failure for this notification only; the
/// listener carries on with the next consumer and does not retry.
#[async_trait]
pub trait Consumer: Debug + Send + Sync + 'static {
    async fn handle(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Logs every notification it receives
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingConsumer;

#[async_trait]
impl Consumer for LoggingConsumer {
    async fn handle(&self, notification: &Notification) -> anyhow::Result<()> {
        if notification.is_database_change() {
            info!(
                channel = notification.channel(),
                sequence_id = ?notification.sequence_id(),
                origin = %notification.origin(),
                table = ?notification.table(),
                action = ?notification.action(),
                record_id = ?notification.record_id(),
                "database change"
            );
        } else {
            info!(
                channel = notification.channel(),
                sequence_id = ?notification.sequence_id(),
                origin = %notification.origin(),
                payload = ?notification.payload(),
                "notification"
            );
        }
        Ok(())
    }
}
