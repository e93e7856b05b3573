//! Originating notifications from application code.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pgwatch_id::SequenceId;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::decoder::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::envelope::encode_envelope;
use crate::notification::Payload;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("channel name must not be empty")]
    EmptyChannel,

    #[error("encoded payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to emit notification: {0}")]
    Emit(String),
}

/// The underlying publish primitive, e.g. `pg_notify`, possibly paired with an outbox insert.
#[async_trait]
pub trait Emitter: Debug + Send + Sync + 'static {
    /// Emit `payload` on `channel` and return the sequence id assigned by the outbox, if any
    async fn emit(
        &self,
        channel: &str,
        payload: &Payload,
    ) -> Result<Option<SequenceId>, PublishError>;
}

/// Validates payloads against the limits the decoder enforces, then hands them to an [`Emitter`].
#[derive(Debug, Clone)]
pub struct Publisher {
    emitter: Arc<dyn Emitter>,
    max_payload_size: usize,
}

impl Publisher {
    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        Self {
            emitter,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub async fn publish(
        &self,
        channel: &str,
        payload: Payload,
    ) -> Result<Option<SequenceId>, PublishError> {
        if channel.is_empty() {
            return Err(PublishError::EmptyChannel);
        }
        // sized with the widest id the envelope can carry
        let size =
            encode_envelope(Some(SequenceId::new(u64::MAX)), Some(Utc::now()), &payload)?.len();
        if size > self.max_payload_size {
            return Err(PublishError::TooLarge {
                size,
                limit: self.max_payload_size,
            });
        }

        let sequence_id = self.emitter.emit(channel, &payload).await?;
        debug!(%channel, ?sequence_id, size, "published notification");
        Ok(sequence_id)
    }

    /// Publish any JSON object; `null` publishes an empty payload
    pub async fn publish_value(
        &self,
        channel: &str,
        value: Value,
    ) -> Result<Option<SequenceId>, PublishError> {
        match value {
            Value::Object(payload) => self.publish(channel, payload).await,
            Value::Null => self.publish(channel, Payload::new()).await,
            _ => Err(PublishError::NotAnObject),
        }
    }
}
