use thiserror::Error;

use crate::validation::AddressError;

/// Errors raised by the conversation store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Contact address failed normalization.
    #[error("invalid contact address: {0}")]
    InvalidAddress(#[from] AddressError),

    /// The history file is not valid JSON.
    #[error("invalid JSON in history file {path}: {source}")]
    MalformedJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The top level of the history file is not a list.
    #[error("history file must contain a list of conversations")]
    NotAList,

    /// A conversation entry is not a JSON object.
    #[error("conversation entry {index} must be an object")]
    EntryNotObject { index: usize },

    /// A conversation entry is an object but one of its fields is unusable.
    #[error("conversation entry {index}: {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("invalid ISO 8601 timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid acknowledgement status: {0}")]
    InvalidAckStatus(String),

    /// A sequence number is already held by a different record.
    #[error("duplicate sequence number {seq} detected for {contact}")]
    DuplicateSequence { seq: u64, contact: String },

    #[error("no conversation found for {0}")]
    NotFound(String),

    #[error("history file io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize history: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl StoreError {
    /// Bad input surfaced to the caller: addresses, text, or the persisted file.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidAddress(_)
                | StoreError::MalformedJson { .. }
                | StoreError::NotAList
                | StoreError::EntryNotObject { .. }
                | StoreError::InvalidEntry { .. }
                | StoreError::InvalidTimestamp(_)
                | StoreError::InvalidAckStatus(_)
        )
    }

    /// Broken cross-record invariant; the operation was aborted.
    pub fn is_consistency(&self) -> bool {
        matches!(self, StoreError::DuplicateSequence { .. })
    }
}
