//! Sequence number index over the conversation store.
//!
//! Maps a device sequence number to the record that owns it. A sequence number
//! belongs to at most one record across every conversation; claiming it for a
//! second record is a [`StoreError::DuplicateSequence`].

use std::collections::HashMap;

use super::error::StoreError;
use super::record::{Conversation, Direction};

/// Where a record lives inside the store. Records are append-only within a
/// conversation, so the position stays valid until the conversation is removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeqLocation {
    pub contact: String,
    pub direction: Direction,
    pub position: usize,
}

#[derive(Debug, Default, Clone)]
pub struct SequenceIndex {
    entries: HashMap<u64, SeqLocation>,
}

impl SequenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every sequenced record of the given conversations.
    pub fn build<'a, I>(conversations: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = &'a Conversation>,
    {
        let mut index = Self::new();
        for conversation in conversations {
            for direction in [Direction::Sent, Direction::Received] {
                for (position, record) in conversation.messages(direction).iter().enumerate() {
                    if let Some(seq) = record.seq {
                        index.insert(
                            seq,
                            SeqLocation {
                                contact: conversation.contact.clone(),
                                direction,
                                position,
                            },
                        )?;
                    }
                }
            }
        }
        Ok(index)
    }

    pub fn get(&self, seq: u64) -> Option<&SeqLocation> {
        self.entries.get(&seq)
    }

    /// Fails if `seq` is held by a record other than `location`.
    pub fn check(&self, seq: u64, location: &SeqLocation) -> Result<(), StoreError> {
        match self.entries.get(&seq) {
            Some(existing) if existing != location => Err(StoreError::DuplicateSequence {
                seq,
                contact: location.contact.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub fn insert(&mut self, seq: u64, location: SeqLocation) -> Result<(), StoreError> {
        self.check(seq, &location)?;
        self.entries.insert(seq, location);
        Ok(())
    }

    pub fn remove(&mut self, seq: u64) -> Option<SeqLocation> {
        self.entries.remove(&seq)
    }

    pub fn max_seq(&self) -> Option<u64> {
        self.entries.keys().copied().max()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
