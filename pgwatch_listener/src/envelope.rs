//! The JSON envelope carried in a notification body.
//!
//! ```text
//! {"notification_id": 42, "timestamp": "2025-01-01T00:00:00Z", "data": {...}}
//! ```
//!
//! `notification_id` is the outbox sequence id (or `null`), `timestamp` the emission time (or
//! `null`), `data` the application payload. A body that is a JSON object without a
//! `notification_id` key predates the envelope and is taken as the payload itself.

use chrono::{DateTime, NaiveDateTime, Utc};
use pgwatch_id::SequenceId;
use serde::Serialize;
use serde_json::Value;

use crate::notification::Payload;

const SEQUENCE_KEY: &str = "notification_id";
const TIMESTAMP_KEY: &str = "timestamp";
const DATA_KEY: &str = "data";

#[derive(Debug, Serialize)]
struct EnvelopeRef<'a> {
    notification_id: Option<SequenceId>,
    timestamp: Option<DateTime<Utc>>,
    data: &'a Payload,
}

/// Encode `payload` into a notification body the decoder reads back losslessly
pub fn encode_envelope(
    sequence_id: Option<SequenceId>,
    emitted_at: Option<DateTime<Utc>>,
    payload: &Payload,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&EnvelopeRef {
        notification_id: sequence_id,
        timestamp: emitted_at,
        data: payload,
    })
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct DecodedEnvelope {
    pub(crate) sequence_id: Option<SequenceId>,
    pub(crate) emitted_at: Option<DateTime<Utc>>,
    pub(crate) payload: Payload,
}

/// Parse a notification body, returning a human readable reason on failure
pub(crate) fn parse_envelope(body: &[u8]) -> Result<DecodedEnvelope, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DecodedEnvelope::default());
    }

    let value: Value = serde_json::from_slice(body).map_err(|e| format!("invalid JSON: {e}"))?;
    let mut object = match value {
        Value::Null => return Ok(DecodedEnvelope::default()),
        Value::Object(object) => object,
        other => {
            return Err(format!(
                "expected a JSON object, found {}",
                json_type_name(&other)
            ));
        }
    };

    if !object.contains_key(SEQUENCE_KEY) {
        return Ok(DecodedEnvelope {
            payload: object,
            ..Default::default()
        });
    }

    let sequence_id = match object.remove(SEQUENCE_KEY) {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_u64() {
            Some(id) => Some(SequenceId::new(id)),
            None => return Err(format!("{SEQUENCE_KEY} must be a non-negative integer, got {n}")),
        },
        Some(other) => {
            return Err(format!(
                "{SEQUENCE_KEY} must be an integer, found {}",
                json_type_name(&other)
            ));
        }
    };

    let payload = match object.remove(DATA_KEY) {
        None | Some(Value::Null) => Payload::new(),
        Some(Value::Object(data)) => data,
        Some(other) => {
            return Err(format!(
                "{DATA_KEY} must be an object, found {}",
                json_type_name(&other)
            ));
        }
    };

    let emitted_at = object.get(TIMESTAMP_KEY).and_then(parse_timestamp);

    Ok(DecodedEnvelope {
        sequence_id,
        emitted_at,
        payload,
    })
}

/// Timestamps come from `to_json(now())` or `now()::text` depending on the trigger, and
/// occasionally as epoch seconds. Anything else is ignored.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z"))
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|t| t.and_utc())
            }),
        Value::Number(n) => n
            .as_f64()
            .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0) as i64)),
        _ => None,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
