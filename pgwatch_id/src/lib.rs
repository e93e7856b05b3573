use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::str::FromStr;

mod sequences;
pub use sequences::ChannelSequences;

/// Position of a notification within the outbox of its channel.
///
/// Sequence ids are assigned by the database side when a notification is
/// written to the outbox, and increase by exactly one per channel.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
#[serde(transparent)]
pub struct SequenceId(u64);

impl SequenceId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The id that directly follows this one, saturating at `u64::MAX`
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Whether `self` is exactly one greater than `previous`
    pub fn is_successor_of(&self, previous: Self) -> bool {
        previous.0.checked_add(1) == Some(self.0)
    }

    /// Number of ids strictly between `previous` and `self`
    pub fn missing_since(&self, previous: Self) -> u64 {
        self.0.saturating_sub(previous.0).saturating_sub(1)
    }
}

impl From<u64> for SequenceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid sequence id {input:?}: {source}")]
pub struct ParseSequenceIdError {
    input: String,
    source: std::num::ParseIntError,
}

impl FromStr for SequenceId {
    type Err = ParseSequenceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|source| ParseSequenceIdError {
                input: s.to_string(),
                source,
            })
    }
}
