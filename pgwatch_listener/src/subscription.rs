//! The subscription connection the listener reads from.
//!
//! The engine never creates database connections itself. A [`SubscriptionSource`] is handed to
//! the listener and asked for a fresh [`Subscription`] on start and after every connection loss.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// An undecoded notification body together with the channel it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub channel: Arc<str>,
    pub body: Bytes,
}

impl RawPayload {
    pub fn new(channel: impl Into<Arc<str>>, body: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            body: body.into(),
        }
    }
}

/// Connection-level failures. All of them are transient from the listener's point of view and
/// lead to a reconnect.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("failed to subscribe to channel {channel:?}: {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("connection lost: {0}")]
    Lost(String),
}

#[async_trait]
pub trait SubscriptionSource: Debug + Send + Sync + 'static {
    /// Open a new connection. No channel is subscribed yet.
    async fn connect(&self) -> Result<Box<dyn Subscription>, ConnectionError>;
}

#[async_trait]
pub trait Subscription: Debug + Send {
    async fn subscribe(&mut self, channel: &str) -> Result<(), ConnectionError>;

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), ConnectionError>;

    /// Wait up to `timeout` for the next payload on any subscribed channel.
    ///
    /// `Ok(None)` means the timeout elapsed. Implementations must be cancel safe: dropping the
    /// future before it completes must not lose a payload.
    async fn read_next(&mut self, timeout: Duration) -> Result<Option<RawPayload>, ConnectionError>;

    /// Release the connection
    async fn close(self: Box<Self>);
}
