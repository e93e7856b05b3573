//! The decoded change event handed to consumers.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pgwatch_id::SequenceId;
use serde_json::{Map, Value};

/// Application data carried by a notification
pub type Payload = Map<String, Value>;

/// Where a notification was read from
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Received on the live subscription connection
    Realtime,
    /// Recovered from the replay store after a reconnect or a detected gap
    Replayed,
}

impl Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Realtime => write!(f, "realtime"),
            Self::Replayed => write!(f, "replayed"),
        }
    }
}

/// The row operation behind a database change notification
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl FromStr for ChangeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "TRUNCATE" => Ok(Self::Truncate),
            other => Err(format!("unknown change action {other:?}")),
        }
    }
}

impl Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
        };
        f.write_str(s)
    }
}

/// One decoded change event.
///
/// Notifications are immutable once built. The `with_*` methods are used by the decoder and by
/// tests to assemble one.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    channel: Arc<str>,
    payload: Payload,
    sequence_id: Option<SequenceId>,
    origin: Origin,
    emitted_at: Option<DateTime<Utc>>,
    received_at: DateTime<Utc>,
}

impl Notification {
    /// A realtime notification received now, without sequence id or emission time
    pub fn new(channel: impl Into<Arc<str>>, payload: Payload) -> Self {
        Self {
            channel: channel.into(),
            payload,
            sequence_id: None,
            origin: Origin::Realtime,
            emitted_at: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_sequence_id(mut self, sequence_id: Option<SequenceId>) -> Self {
        self.sequence_id = sequence_id;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_emitted_at(mut self, emitted_at: Option<DateTime<Utc>>) -> Self {
        self.emitted_at = emitted_at;
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub(crate) fn channel_arc(&self) -> Arc<str> {
        Arc::clone(&self.channel)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn sequence_id(&self) -> Option<SequenceId> {
        self.sequence_id
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_replay(&self) -> bool {
        self.origin == Origin::Replayed
    }

    /// Time the source stamped on the notification, if any
    pub fn emitted_at(&self) -> Option<DateTime<Utc>> {
        self.emitted_at
    }

    /// Time the decoder produced this notification
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Whether the payload was produced by a row-level change trigger, i.e. carries both a
    /// `table` and an `action`
    pub fn is_database_change(&self) -> bool {
        self.payload.contains_key("table") && self.payload.contains_key("action")
    }

    pub fn table(&self) -> Option<&str> {
        self.payload.get("table").and_then(Value::as_str)
    }

    pub fn action(&self) -> Option<ChangeAction> {
        self.payload
            .get("action")
            .and_then(Value::as_str)
            .and_then(|a| a.parse().ok())
    }

    /// Row image after the change, absent for deletes
    pub fn new_data(&self) -> Option<&Payload> {
        self.payload.get("new_data").and_then(Value::as_object)
    }

    /// Row image before the change, absent for inserts
    pub fn old_data(&self) -> Option<&Payload> {
        self.payload.get("old_data").and_then(Value::as_object)
    }

    /// Primary key of the changed row: `record_id` when the trigger sets it, otherwise the `id`
    /// of the new or old row image.
    pub fn record_id(&self) -> Option<&Value> {
        self.payload
            .get("record_id")
            .filter(|v| !v.is_null())
            .or_else(|| self.new_data().and_then(|d| d.get("id")))
            .or_else(|| self.old_data().and_then(|d| d.get("id")))
    }
}

impl Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.channel)?;
        if let Some(id) = self.sequence_id {
            write!(f, "#{id}")?;
        }
        write!(f, " ({})", self.origin)
    }
}
