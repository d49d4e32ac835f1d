//! Callback registry for device events.
//!
//! Handlers run on the reader task in registration order. They must not block;
//! a UI should hand events over to its own thread.
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::protocol::LinkStats;

/// `(contact, text, statistics)`
pub type MessageHandler = Arc<dyn Fn(&str, &str, Option<&LinkStats>) + Send + Sync>;
/// `(contact, timestamp of the confirmed send)`
pub type AckHandler = Arc<dyn Fn(&str, DateTime<Utc>) + Send + Sync>;
pub type StatsHandler = Arc<dyn Fn(&LinkStats) + Send + Sync>;
/// `(contact, raw device sequence number, timestamp of the send)`
pub type SequenceHandler = Arc<dyn Fn(&str, u32, DateTime<Utc>) + Send + Sync>;

#[derive(Default)]
pub struct Subscribers {
    message: RwLock<Vec<MessageHandler>>,
    ack: RwLock<Vec<AckHandler>>,
    stats: RwLock<Vec<StatsHandler>>,
    sequence: RwLock<Vec<SequenceHandler>>,
}

fn snapshot<T: Clone>(handlers: &RwLock<Vec<T>>) -> Vec<T> {
    match handlers.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn register<T>(handlers: &RwLock<Vec<T>>, handler: T) {
    match handlers.write() {
        Ok(mut guard) => guard.push(handler),
        Err(poisoned) => poisoned.into_inner().push(handler),
    }
}

impl Subscribers {
    pub fn add_message(&self, handler: MessageHandler) {
        register(&self.message, handler);
    }

    pub fn add_ack(&self, handler: AckHandler) {
        register(&self.ack, handler);
    }

    pub fn add_stats(&self, handler: StatsHandler) {
        register(&self.stats, handler);
    }

    pub fn add_sequence(&self, handler: SequenceHandler) {
        register(&self.sequence, handler);
    }

    // handlers are cloned out first so a handler may itself subscribe

    pub fn notify_message(&self, contact: &str, text: &str, stats: Option<&LinkStats>) {
        for handler in snapshot(&self.message) {
            handler(contact, text, stats);
        }
    }

    pub fn notify_ack(&self, contact: &str, timestamp: DateTime<Utc>) {
        for handler in snapshot(&self.ack) {
            handler(contact, timestamp);
        }
    }

    pub fn notify_stats(&self, stats: &LinkStats) {
        for handler in snapshot(&self.stats) {
            handler(stats);
        }
    }

    pub fn notify_sequence(&self, contact: &str, seq: u32, timestamp: DateTime<Utc>) {
        for handler in snapshot(&self.sequence) {
            handler(contact, seq, timestamp);
        }
    }
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("message", &snapshot(&self.message).len())
            .field("ack", &snapshot(&self.ack).len())
            .field("stats", &snapshot(&self.stats).len())
            .field("sequence", &snapshot(&self.sequence).len())
            .finish()
    }
}
