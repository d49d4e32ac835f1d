//! # Storage Module - Conversation History
//!
//! Keeps every message exchanged with every contact, the acknowledgement state of
//! each sent message and the device sequence numbers that correlate low level
//! transmissions with messages.
//!
//! The whole history lives in one JSON file (see [`record`] for the layout). The
//! in-memory state is authoritative; with autosave enabled every mutation
//! regenerates the complete file through a locked, atomic rename.
//!
//! ```rust,no_run
//! use vlcchat::storage::{AckStatus, ConversationStore};
//!
//! # fn main() -> Result<(), vlcchat::storage::StoreError> {
//! let mut store = ConversationStore::open(".data/history.json")?;
//! let sent = store.record_sent("ab", "hello", None, AckStatus::Outstanding, None)?;
//! store.fail_pending_ack("AB", sent.timestamp)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! The store itself is not synchronized. The device reader, the caller and the
//! ack timeout timers all share one [`SharedStore`] so every mutation, including
//! its sequence index update, happens under a single lock.

pub mod error;
pub mod index;
pub mod record;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, info, warn};
use serde_json::Value;

pub use error::StoreError;
pub use index::{SeqLocation, SequenceIndex};
pub use record::{
    format_timestamp, now_utc, parse_timestamp, AckStatus, Conversation, Direction,
    MessageRecord, TimelineEntry,
};

use crate::validation::normalize_address;
use record::{conversation_from_value, normalize_timestamp, LegacyClock, StoredConversation};

/// Store shared between the device reader, the session and timers.
pub type SharedStore = Arc<Mutex<ConversationStore>>;

#[derive(Debug)]
pub struct ConversationStore {
    path: PathBuf,
    autosave: bool,
    conversations: HashMap<String, Conversation>,
    /// Contacts in first-seen order
    order: Vec<String>,
    index: SequenceIndex,
    seq_offset: u64,
}

struct LoadedHistory {
    conversations: HashMap<String, Conversation>,
    order: Vec<String>,
    index: SequenceIndex,
}

impl ConversationStore {
    /// Open the history file at `path`, starting empty when it does not exist yet.
    /// The parent directory is created if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut store = Self {
            path,
            autosave: true,
            conversations: HashMap::new(),
            order: Vec::new(),
            index: SequenceIndex::new(),
            seq_offset: 0,
        };
        store.reload()?;
        Ok(store)
    }

    pub fn with_autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the history file. On error the current state is left untouched.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        let loaded = match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => LoadedHistory::empty(),
            Ok(raw) => LoadedHistory::parse(&self.path, &raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LoadedHistory::empty(),
            Err(e) => return Err(e.into()),
        };
        self.seq_offset = loaded.index.max_seq().unwrap_or(0);
        self.conversations = loaded.conversations;
        self.order = loaded.order;
        self.index = loaded.index;
        info!(
            "Loaded {} conversation(s) from {} (sequence offset {})",
            self.order.len(),
            self.path.display(),
            self.seq_offset
        );
        Ok(())
    }

    /// Rewrite the whole history file from memory.
    pub fn save(&self) -> Result<(), StoreError> {
        let stored: Vec<StoredConversation<'_>> = self
            .order
            .iter()
            .filter_map(|contact| self.conversations.get(contact))
            .map(StoredConversation::from_conversation)
            .collect();
        let content = serde_json::to_string_pretty(&stored).map_err(StoreError::Serialize)?;
        write_file_locked(&self.path, &content)?;
        debug!("Saved {} conversation(s) to {}", stored.len(), self.path.display());
        Ok(())
    }

    fn persist(&self) -> Result<(), StoreError> {
        if self.autosave {
            self.save()
        } else {
            Ok(())
        }
    }

    pub fn list_contacts(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Conversations in contact order.
    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> + '_ {
        self.order
            .iter()
            .filter_map(move |contact| self.conversations.get(contact))
    }

    pub fn contains(&self, contact: &str) -> bool {
        normalize_address(contact)
            .map(|contact| self.conversations.contains_key(&contact))
            .unwrap_or(false)
    }

    /// Copy of one conversation.
    pub fn get_conversation(&self, contact: &str) -> Result<Conversation, StoreError> {
        let contact = normalize_address(contact)?;
        self.conversations
            .get(&contact)
            .cloned()
            .ok_or(StoreError::NotFound(contact))
    }

    pub fn record_sent(
        &mut self,
        contact: &str,
        text: &str,
        timestamp: Option<DateTime<Utc>>,
        ack_status: AckStatus,
        seq: Option<u64>,
    ) -> Result<MessageRecord, StoreError> {
        self.append(contact, Direction::Sent, text, timestamp, Some(ack_status), seq)
    }

    pub fn record_received(
        &mut self,
        contact: &str,
        text: &str,
        timestamp: Option<DateTime<Utc>>,
        seq: Option<u64>,
    ) -> Result<MessageRecord, StoreError> {
        self.append(contact, Direction::Received, text, timestamp, None, seq)
    }

    fn append(
        &mut self,
        contact: &str,
        direction: Direction,
        text: &str,
        timestamp: Option<DateTime<Utc>>,
        ack_status: Option<AckStatus>,
        seq: Option<u64>,
    ) -> Result<MessageRecord, StoreError> {
        let contact = normalize_address(contact)?;
        let position = self
            .conversations
            .get(&contact)
            .map(|c| c.messages(direction).len())
            .unwrap_or(0);
        let location = SeqLocation {
            contact: contact.clone(),
            direction,
            position,
        };
        // nothing is touched until the sequence number is known to be free
        if let Some(seq) = seq {
            self.index.check(seq, &location)?;
        }

        let record = MessageRecord {
            timestamp: normalize_timestamp(timestamp.unwrap_or_else(Utc::now)),
            text: text.to_string(),
            ack_status,
            seq,
        };
        let created = !self.conversations.contains_key(&contact);
        if created {
            self.order.push(contact.clone());
        }
        self.conversations
            .entry(contact.clone())
            .or_insert_with(|| Conversation::new(contact.clone()))
            .messages_mut(direction)
            .push(record.clone());
        if let Some(seq) = seq {
            self.index.insert(seq, location)?;
        }
        if let Err(e) = self.persist() {
            self.rollback_append(&contact, direction, seq, created);
            return Err(e);
        }
        Ok(record)
    }

    /// Undo the last `append` after a failed save.
    fn rollback_append(
        &mut self,
        contact: &str,
        direction: Direction,
        seq: Option<u64>,
        created: bool,
    ) {
        if let Some(seq) = seq {
            self.index.remove(seq);
        }
        if created {
            self.conversations.remove(contact);
            self.order.retain(|c| c != contact);
        } else if let Some(conversation) = self.conversations.get_mut(contact) {
            conversation.messages_mut(direction).pop();
        }
        warn!("Discarded unsaved message for {}", contact);
    }

    /// Set the acknowledgement state of the sent message at `timestamp`.
    /// Returns `false` when there is no such message or nothing changed.
    pub fn set_ack(
        &mut self,
        contact: &str,
        timestamp: DateTime<Utc>,
        status: AckStatus,
    ) -> Result<bool, StoreError> {
        let contact = normalize_address(contact)?;
        let timestamp = normalize_timestamp(timestamp);
        let Some(record) = self.sent_at_mut(&contact, timestamp, |r| r.ack_status != Some(status))
        else {
            return Ok(false);
        };
        record.ack_status = Some(status);
        self.persist()?;
        Ok(true)
    }

    /// Set the acknowledgement state of the sent message holding `seq`.
    /// Received messages and unknown sequence numbers are left alone.
    pub fn set_ack_by_sequence(&mut self, seq: u64, status: AckStatus) -> Result<bool, StoreError> {
        let Some(location) = self.index.get(seq).cloned() else {
            return Ok(false);
        };
        if location.direction != Direction::Sent {
            return Ok(false);
        }
        let Some(record) = self
            .conversations
            .get_mut(&location.contact)
            .and_then(|c| c.sent.get_mut(location.position))
        else {
            return Ok(false);
        };
        if record.ack_status == Some(status) {
            return Ok(false);
        }
        record.ack_status = Some(status);
        self.persist()?;
        Ok(true)
    }

    /// Ack timeout: mark the message failed unless it already reached a terminal state.
    pub fn fail_pending_ack(
        &mut self,
        contact: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let contact = normalize_address(contact)?;
        let timestamp = normalize_timestamp(timestamp);
        let pending = |r: &MessageRecord| !r.ack_status.map(AckStatus::is_terminal).unwrap_or(false);
        let Some(record) = self.sent_at_mut(&contact, timestamp, pending) else {
            return Ok(false);
        };
        record.ack_status = Some(AckStatus::Failed);
        self.persist()?;
        Ok(true)
    }

    /// Attach a sequence number to the sent message at `timestamp`.
    pub fn set_sequence(
        &mut self,
        contact: &str,
        timestamp: DateTime<Utc>,
        seq: u64,
    ) -> Result<bool, StoreError> {
        let contact = normalize_address(contact)?;
        let timestamp = normalize_timestamp(timestamp);
        let Some(conversation) = self.conversations.get(&contact) else {
            return Ok(false);
        };
        let at_timestamp = || {
            conversation
                .sent
                .iter()
                .enumerate()
                .filter(|(_, r)| r.timestamp == timestamp)
        };
        if at_timestamp().any(|(_, r)| r.seq == Some(seq)) {
            return Ok(false);
        }
        let Some(position) = at_timestamp()
            .find(|(_, r)| r.seq.is_none())
            .or_else(|| at_timestamp().next())
            .map(|(i, _)| i)
        else {
            return Ok(false);
        };
        let location = SeqLocation {
            contact: contact.clone(),
            direction: Direction::Sent,
            position,
        };
        self.index.check(seq, &location)?;

        let Some(record) = self
            .conversations
            .get_mut(&contact)
            .and_then(|c| c.sent.get_mut(position))
        else {
            return Ok(false);
        };
        if let Some(stale) = record.seq.replace(seq) {
            self.index.remove(stale);
        }
        self.index.insert(seq, location)?;
        self.persist()?;
        Ok(true)
    }

    /// Remove a contact and its messages. Returns `false` for unknown contacts.
    pub fn delete_contact(&mut self, contact: &str) -> Result<bool, StoreError> {
        let contact = normalize_address(contact)?;
        let Some(removed) = self.conversations.remove(&contact) else {
            return Ok(false);
        };
        self.order.retain(|c| c != &contact);
        for record in removed.sent.iter().chain(removed.received.iter()) {
            if let Some(seq) = record.seq {
                self.index.remove(seq);
            }
        }
        info!("Deleted conversation with {}", contact);
        self.persist()?;
        Ok(true)
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.conversations.clear();
        self.order.clear();
        self.index.clear();
        self.persist()
    }

    /// Highest sequence number present when the file was last loaded.
    pub fn seq_offset(&self) -> u64 {
        self.seq_offset
    }

    /// Map a per-session device sequence number into the store's sequence space.
    pub fn normalize_seq(&self, raw: u32) -> u64 {
        u64::from(raw) + self.seq_offset + 1
    }

    /// Sequence number currently held by a record, if any.
    pub fn sequence_location(&self, seq: u64) -> Option<&SeqLocation> {
        self.index.get(seq)
    }

    /// The record holding `seq` with its contact.
    pub fn record_by_sequence(&self, seq: u64) -> Option<(&str, &MessageRecord)> {
        let location = self.index.get(seq)?;
        let conversation = self.conversations.get(&location.contact)?;
        let record = conversation.messages(location.direction).get(location.position)?;
        Some((conversation.contact.as_str(), record))
    }

    fn sent_at_mut<F>(
        &mut self,
        contact: &str,
        timestamp: DateTime<Utc>,
        mut accept: F,
    ) -> Option<&mut MessageRecord>
    where
        F: FnMut(&MessageRecord) -> bool,
    {
        self.conversations
            .get_mut(contact)?
            .sent
            .iter_mut()
            .find(|r| r.timestamp == timestamp && accept(r))
    }
}

impl LoadedHistory {
    fn empty() -> Self {
        Self {
            conversations: HashMap::new(),
            order: Vec::new(),
            index: SequenceIndex::new(),
        }
    }

    fn parse(path: &Path, raw: &str) -> Result<Self, StoreError> {
        let value: Value = serde_json::from_str(raw).map_err(|source| StoreError::MalformedJson {
            path: path.display().to_string(),
            source,
        })?;
        let Value::Array(entries) = value else {
            return Err(StoreError::NotAList);
        };

        let mut clock = LegacyClock::default();
        let mut loaded = Self::empty();
        for (index, entry) in entries.iter().enumerate() {
            let parsed = conversation_from_value(index, entry, &mut clock)?;
            match loaded.conversations.get_mut(&parsed.contact) {
                // the same contact listed twice is merged into one conversation
                Some(existing) => {
                    existing.sent.extend(parsed.sent);
                    existing.received.extend(parsed.received);
                }
                None => {
                    loaded.order.push(parsed.contact.clone());
                    loaded.conversations.insert(parsed.contact.clone(), parsed);
                }
            }
        }
        loaded.index = SequenceIndex::build(
            loaded
                .order
                .iter()
                .filter_map(|contact| loaded.conversations.get(contact)),
        )?;
        Ok(loaded)
    }
}

/// Replace `path` with `content` under an exclusive lock: write a sibling temp
/// file, fsync it, rename it over the target and fsync the directory.
fn write_file_locked(path: &Path, content: &str) -> std::io::Result<()> {
    use std::fs::{self, File, OpenOptions};
    use std::io::Write;

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    lock_file.lock_exclusive()?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("history.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
            }
            Err(e) => return Err(e),
        }
    };

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    drop(lock_file);
    Ok(())
}
