//! Turns raw subscription payloads into [`Notification`]s.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::envelope::parse_envelope;
use crate::notification::{Notification, Origin};
use crate::subscription::RawPayload;

/// Largest body accepted by default. Matches the default `NOTIFY` payload ceiling of PostgreSQL.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 8 * 1024;

/// How much of a rejected body is kept for diagnostics
const RAW_PREVIEW_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload on channel {channel:?} is {size} bytes, limit is {limit}")]
    TooLarge {
        channel: Arc<str>,
        size: usize,
        limit: usize,
    },

    #[error("malformed payload on channel {channel:?}: {reason} (raw: {raw})")]
    Malformed {
        channel: Arc<str>,
        raw: String,
        reason: String,
    },
}

impl DecodeError {
    pub fn channel(&self) -> &str {
        match self {
            Self::TooLarge { channel, .. } | Self::Malformed { channel, .. } => channel,
        }
    }
}

/// Stateless and cheap to copy, so the listener and the replay path each keep their own.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    max_payload_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

impl Decoder {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Decode a payload read from the live connection
    pub fn decode(&self, raw: &RawPayload) -> Result<Notification, DecodeError> {
        self.decode_with_origin(raw, Origin::Realtime)
    }

    /// Decode a payload returned by a replay store
    pub fn decode_replayed(&self, raw: &RawPayload) -> Result<Notification, DecodeError> {
        self.decode_with_origin(raw, Origin::Replayed)
    }

    pub fn decode_with_origin(
        &self,
        raw: &RawPayload,
        origin: Origin,
    ) -> Result<Notification, DecodeError> {
        let size = raw.body.len();
        if size > self.max_payload_size {
            return Err(DecodeError::TooLarge {
                channel: Arc::clone(&raw.channel),
                size,
                limit: self.max_payload_size,
            });
        }

        if raw.channel.is_empty() {
            return Err(malformed(raw, "empty channel name"));
        }

        let envelope = parse_envelope(&raw.body).map_err(|reason| malformed(raw, reason))?;

        Ok(Notification::new(Arc::clone(&raw.channel), envelope.payload)
            .with_sequence_id(envelope.sequence_id)
            .with_emitted_at(envelope.emitted_at)
            .with_origin(origin)
            .with_received_at(Utc::now()))
    }
}

fn malformed(raw: &RawPayload, reason: impl Into<String>) -> DecodeError {
    let text = String::from_utf8_lossy(&raw.body);
    let raw_text = match text.char_indices().nth(RAW_PREVIEW_LEN) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    };
    DecodeError::Malformed {
        channel: Arc::clone(&raw.channel),
        raw: raw_text,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgwatch_id::SequenceId;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn decodes_an_envelope() {
        let raw = RawPayload::new(
            "orders",
            r#"{"notification_id": 3, "timestamp": null, "data": {"event": "created", "id": 7}}"#,
        );
        let n = Decoder::default().decode(&raw).unwrap();
        assert_eq!(n.channel(), "orders");
        assert_eq!(n.sequence_id(), Some(SequenceId::new(3)));
        assert_eq!(n.origin(), Origin::Realtime);
        assert_eq!(n.emitted_at(), None);
        assert_eq!(
            serde_json::Value::Object(n.payload().clone()),
            json!({"event": "created", "id": 7})
        );
    }

    #[test]
    fn replayed_payloads_are_marked() {
        let raw = RawPayload::new("orders", r#"{"notification_id": 1, "data": {}}"#);
        let n = Decoder::default().decode_replayed(&raw).unwrap();
        assert!(n.is_replay());
    }

    #[test]
    fn oversized_payloads_are_rejected_before_parsing() {
        let raw = RawPayload::new("orders", "x".repeat(17));
        let err = Decoder::new(16).decode(&raw).unwrap_err();
        assert!(
            matches!(err, DecodeError::TooLarge { size: 17, limit: 16, .. }),
            "{err:?}"
        );
        assert_eq!(err.channel(), "orders");

        // exactly at the limit is fine
        let raw = RawPayload::new("orders", format!("{{\"a\":\"{}\"}}", "x".repeat(8)));
        assert_eq!(raw.body.len(), 16);
        Decoder::new(16).decode(&raw).unwrap();
    }

    #[test]
    fn malformed_payloads_keep_the_raw_text() {
        let err = Decoder::default()
            .decode(&RawPayload::new("orders", "not json at all"))
            .unwrap_err();
        match err {
            DecodeError::Malformed { raw, reason, .. } => {
                assert_eq!(raw, "not json at all");
                assert!(reason.starts_with("invalid JSON"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let err = Decoder::default()
            .decode(&RawPayload::new("", "{}"))
            .unwrap_err();
        assert!(err.to_string().contains("empty channel name"), "{err}");
    }

    #[test]
    fn long_raw_text_is_truncated() {
        let body = format!("[{}", "1,".repeat(1000));
        let err = Decoder::new(usize::MAX)
            .decode(&RawPayload::new("orders", body))
            .unwrap_err();
        let DecodeError::Malformed { raw, .. } = err else {
            panic!("expected malformed");
        };
        assert_eq!(raw.len(), RAW_PREVIEW_LEN + 3);
        assert!(raw.ends_with("..."));
    }
}
