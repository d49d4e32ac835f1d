//! Conversation records and their on-disk representation.
//!
//! The history file is a JSON list with one object per contact:
//!
//! ```json
//! [
//!   {
//!     "MAC": "AB",
//!     "SentMessages": [{"timestamp": "2025-11-08T14:36:20Z", "message": "hello", "ack": "true", "seq": 1}],
//!     "ReceivedMessages": [{"timestamp": "2025-11-08T14:37:20.250000Z", "message": "hi", "seq": 2}]
//!   }
//! ]
//! ```
//!
//! Older files stored bare strings instead of message objects. Those still load:
//! they get synthetic, strictly increasing timestamps starting at the Unix epoch
//! and sent messages are treated as confirmed.

use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use super::error::StoreError;
use crate::validation::normalize_address;

/// Acknowledgement lifecycle of a sent message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckStatus {
    Outstanding,
    Confirmed,
    Failed,
}

impl AckStatus {
    /// Confirmed and failed are terminal for the normal flow.
    pub fn is_terminal(self) -> bool {
        !matches!(self, AckStatus::Outstanding)
    }

    /// Persisted spelling, kept compatible with existing history files.
    pub fn as_str(self) -> &'static str {
        match self {
            AckStatus::Outstanding => "outstanding",
            AckStatus::Confirmed => "true",
            AckStatus::Failed => "false",
        }
    }

    /// Accepts the persisted spellings plus `pending` (case-insensitive).
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(AckStatus::Confirmed),
            "false" => Ok(AckStatus::Failed),
            "outstanding" | "pending" => Ok(AckStatus::Outstanding),
            _ => Err(StoreError::InvalidAckStatus(raw.to_string())),
        }
    }
}

impl From<bool> for AckStatus {
    fn from(delivered: bool) -> Self {
        if delivered {
            AckStatus::Confirmed
        } else {
            AckStatus::Failed
        }
    }
}

impl std::fmt::Display for AckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AckStatus::Outstanding => "outstanding",
            AckStatus::Confirmed => "confirmed",
            AckStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    fn field(self) -> &'static str {
        match self {
            Direction::Sent => "SentMessages",
            Direction::Received => "ReceivedMessages",
        }
    }
}

/// One message in a conversation. `ack_status` is only set on sent messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub ack_status: Option<AckStatus>,
    pub seq: Option<u64>,
}

/// All messages exchanged with one contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub contact: String,
    pub sent: Vec<MessageRecord>,
    pub received: Vec<MessageRecord>,
}

/// A message in chronological view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry<'a> {
    pub direction: Direction,
    pub record: &'a MessageRecord,
}

impl Conversation {
    pub fn new(contact: impl Into<String>) -> Self {
        Self {
            contact: contact.into(),
            sent: Vec::new(),
            received: Vec::new(),
        }
    }

    pub fn messages(&self, direction: Direction) -> &[MessageRecord] {
        match direction {
            Direction::Sent => &self.sent,
            Direction::Received => &self.received,
        }
    }

    pub(crate) fn messages_mut(&mut self, direction: Direction) -> &mut Vec<MessageRecord> {
        match direction {
            Direction::Sent => &mut self.sent,
            Direction::Received => &mut self.received,
        }
    }

    /// Both directions merged by timestamp; on a tie the received message comes first.
    pub fn timeline(&self) -> Vec<TimelineEntry<'_>> {
        let mut entries: Vec<TimelineEntry<'_>> = self
            .received
            .iter()
            .map(|record| TimelineEntry {
                direction: Direction::Received,
                record,
            })
            .chain(self.sent.iter().map(|record| TimelineEntry {
                direction: Direction::Sent,
                record,
            }))
            .collect();
        // stable sort keeps insertion order within a direction
        entries.sort_by_key(|e| (e.record.timestamp, e.direction == Direction::Sent));
        entries
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.received.is_empty()
    }
}

/// Current time at the precision the history file can represent.
pub fn now_utc() -> DateTime<Utc> {
    normalize_timestamp(Utc::now())
}

/// Truncate to microseconds so in-memory and persisted timestamps compare equal.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// ISO-8601 in UTC with a literal `Z`; fractional seconds only when present.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    let ts = normalize_timestamp(*ts);
    if ts.timestamp_subsec_micros() == 0 {
        ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    } else {
        ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
    }
}

/// Parse an ISO-8601 timestamp. Offsets are converted to UTC; a timestamp without
/// any zone designator is taken to be UTC already.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(normalize_timestamp(ts.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| normalize_timestamp(Utc.from_utc_datetime(&naive)))
        .map_err(|_| StoreError::InvalidTimestamp(raw.to_string()))
}

/// Synthetic timestamps for legacy string-only records. Owned by a single load so
/// consecutive loads produce the same values.
#[derive(Debug, Default)]
pub(crate) struct LegacyClock {
    sent: i64,
    received: i64,
}

impl LegacyClock {
    fn next(&mut self, direction: Direction) -> DateTime<Utc> {
        let counter = match direction {
            Direction::Sent => &mut self.sent,
            Direction::Received => &mut self.received,
        };
        let ts = DateTime::<Utc>::default() + Duration::milliseconds(*counter);
        *counter += 1;
        ts
    }
}

/// Parse one conversation object from the history file.
pub(crate) fn conversation_from_value(
    index: usize,
    entry: &Value,
    clock: &mut LegacyClock,
) -> Result<Conversation, StoreError> {
    let object = entry
        .as_object()
        .ok_or(StoreError::EntryNotObject { index })?;
    let contact = object
        .get("MAC")
        .and_then(Value::as_str)
        .filter(|mac| !mac.trim().is_empty())
        .ok_or_else(|| StoreError::InvalidEntry {
            index,
            reason: "missing a valid MAC address".to_string(),
        })?;
    let contact = normalize_address(contact)?;

    let sent = messages_from_value(index, object, Direction::Sent, clock)?;
    let received = messages_from_value(index, object, Direction::Received, clock)?;
    Ok(Conversation {
        contact,
        sent,
        received,
    })
}

fn messages_from_value(
    index: usize,
    object: &Map<String, Value>,
    direction: Direction,
    clock: &mut LegacyClock,
) -> Result<Vec<MessageRecord>, StoreError> {
    let key = direction.field();
    let entries = match object.get(key) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            return Err(StoreError::InvalidEntry {
                index,
                reason: format!("{} must be a list", key),
            })
        }
    };
    entries
        .iter()
        .map(|value| record_from_value(index, value, direction, clock))
        .collect()
}

fn record_from_value(
    index: usize,
    value: &Value,
    direction: Direction,
    clock: &mut LegacyClock,
) -> Result<MessageRecord, StoreError> {
    let key = direction.field();
    let invalid = |reason: String| StoreError::InvalidEntry { index, reason };
    let implicit_ack = match direction {
        Direction::Sent => Some(AckStatus::Confirmed),
        Direction::Received => None,
    };

    let object = match value {
        Value::String(text) => {
            return Ok(MessageRecord {
                timestamp: clock.next(direction),
                text: text.clone(),
                ack_status: implicit_ack,
                seq: None,
            })
        }
        Value::Object(object) => object,
        _ => return Err(invalid(format!("message entries in {} must be objects", key))),
    };

    let text = match object.get("message") {
        Some(Value::String(text)) => text.clone(),
        Some(_) => return Err(invalid(format!("message text in {} must be a string", key))),
        None => return Err(invalid(format!("message entry in {} missing 'message'", key))),
    };
    let timestamp = match object.get("timestamp") {
        Some(Value::String(raw)) => parse_timestamp(raw)?,
        _ => return Err(invalid(format!("message timestamp in {} must be a string", key))),
    };
    let ack_status = match object.get("ack") {
        None | Some(Value::Null) => implicit_ack,
        Some(Value::Bool(flag)) => Some(AckStatus::from(*flag)),
        Some(Value::String(raw)) => Some(AckStatus::parse(raw)?),
        Some(other) => return Err(StoreError::InvalidAckStatus(other.to_string())),
    };
    // received messages never carry an acknowledgement
    let ack_status = match direction {
        Direction::Sent => ack_status,
        Direction::Received => None,
    };
    let seq = object.get("seq").and_then(seq_from_value);

    Ok(MessageRecord {
        timestamp,
        text,
        ack_status,
        seq,
    })
}

/// Lenient sequence parsing: integers or numeric strings, anything else is absent.
fn seq_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Serialize)]
pub(crate) struct StoredConversation<'a> {
    #[serde(rename = "MAC")]
    mac: &'a str,
    #[serde(rename = "SentMessages")]
    sent: Vec<StoredRecord<'a>>,
    #[serde(rename = "ReceivedMessages")]
    received: Vec<StoredRecord<'a>>,
}

#[derive(Serialize)]
struct StoredRecord<'a> {
    timestamp: String,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ack: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
}

impl<'a> StoredConversation<'a> {
    pub(crate) fn from_conversation(conversation: &'a Conversation) -> Self {
        let stored = |records: &'a [MessageRecord], with_ack: bool| -> Vec<StoredRecord<'a>> {
            records
                .iter()
                .map(|record| StoredRecord {
                    timestamp: format_timestamp(&record.timestamp),
                    message: &record.text,
                    ack: if with_ack {
                        record.ack_status.map(AckStatus::as_str)
                    } else {
                        None
                    },
                    seq: record.seq,
                })
                .collect()
        };
        Self {
            mac: &conversation.contact,
            sent: stored(&conversation.sent, true),
            received: stored(&conversation.received, false),
        }
    }
}
