//! Per-channel sequence bookkeeping that can be persisted between runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::SequenceId;

/// The highest [`SequenceId`] known for each channel.
///
/// Entries only ever move forward through [`advance`][ChannelSequences::advance]; an explicit
/// [`set`][ChannelSequences::set] is needed to move one backwards. Iteration is ordered by channel
/// name so the serialized form is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelSequences(BTreeMap<String, SequenceId>);

impl ChannelSequences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel: &str) -> Option<SequenceId> {
        self.0.get(channel).copied()
    }

    /// Record `id` for `channel` if it is greater than what is already held.
    ///
    /// Returns `true` if the entry changed.
    pub fn advance(&mut self, channel: &str, id: SequenceId) -> bool {
        match self.0.get_mut(channel) {
            Some(current) if *current >= id => false,
            Some(current) => {
                *current = id;
                true
            }
            None => {
                self.0.insert(channel.to_string(), id);
                true
            }
        }
    }

    pub fn set(&mut self, channel: &str, id: SequenceId) {
        self.0.insert(channel.to_string(), id);
    }

    pub fn remove(&mut self, channel: &str) -> Option<SequenceId> {
        self.0.remove(channel)
    }

    /// Advance every entry of `self` with the entries of `other`
    pub fn merge(&mut self, other: &Self) {
        for (channel, id) in other.iter() {
            self.advance(channel, id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, SequenceId)> {
        self.0.iter().map(|(c, id)| (c.as_str(), *id))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, SequenceId)> for ChannelSequences {
    fn from_iter<T: IntoIterator<Item = (S, SequenceId)>>(iter: T) -> Self {
        let mut sequences = Self::new();
        for (channel, id) in iter {
            let channel: String = channel.into();
            sequences.advance(&channel, id);
        }
        sequences
    }
}
