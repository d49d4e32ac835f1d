//! Chat session: connects the device engine to the conversation store.
//!
//! Every device event becomes a store mutation, every outgoing message is
//! recorded before it is written, and each send gets an ack timeout that marks it
//! failed if the device never confirms it. What happened is reported on an
//! event channel for whatever front end is attached.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::config::SessionConfig;
use crate::device::{lock, DeviceError, LinkState, VlcDevice};
use crate::logutil::preview;
use crate::metrics;
use crate::protocol::{encode_send, LinkStats};
use crate::storage::{AckStatus, MessageRecord, SharedStore, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Things a front end shows to the user
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Received {
        contact: String,
        text: String,
        stats: Option<LinkStats>,
    },
    Delivered {
        contact: String,
        timestamp: DateTime<Utc>,
    },
    /// No acknowledgement arrived within the ack timeout.
    TimedOut {
        contact: String,
        timestamp: DateTime<Utc>,
    },
}

pub struct ChatSession {
    device: Arc<VlcDevice>,
    store: SharedStore,
    ack_timeout: Duration,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChatSession {
    /// Subscribe to `device` and return the session with its event feed.
    pub fn new(
        device: Arc<VlcDevice>,
        store: SharedStore,
        config: &SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            device,
            store,
            ack_timeout: config.ack_timeout(),
            events_tx,
        };
        session.subscribe();
        (session, events_rx)
    }

    fn subscribe(&self) {
        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        self.device.subscribe_message(move |contact, text, stats| {
            if let Some(record) = store_received(&store, contact, text, stats) {
                debug!("Stored message from {} at {}", contact, record.timestamp);
                let _ = events.send(SessionEvent::Received {
                    contact: contact.to_string(),
                    text: text.to_string(),
                    stats: stats.cloned(),
                });
            }
        });

        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        self.device.subscribe_ack(move |contact, timestamp| {
            match lock(&store).set_ack(contact, timestamp, AckStatus::Confirmed) {
                Ok(true) => {
                    let _ = events.send(SessionEvent::Delivered {
                        contact: contact.to_string(),
                        timestamp,
                    });
                }
                Ok(false) => debug!("Ack for {} at {} changed nothing", contact, timestamp),
                Err(e) => warn!("Failed to record ack from {}: {}", contact, e),
            }
        });

        let store = Arc::clone(&self.store);
        self.device.subscribe_sequence(move |contact, raw_seq, timestamp| {
            let mut store = lock(&store);
            let seq = store.normalize_seq(raw_seq);
            match store.set_sequence(contact, timestamp, seq) {
                Ok(true) => info!("Sequence {} assigned to message for {}", seq, contact),
                Ok(false) => {}
                Err(e) => warn!("Cannot assign sequence {} to {}: {}", seq, contact, e),
            }
        });

        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        self.device.subscribe_stats(move |stats| {
            debug!("STAT {:?}", stats);
            if !(stats.is_receive() && stats.is_ack()) {
                return;
            }
            let Some(raw_seq) = stats.seq else {
                return;
            };
            let mut store = lock(&store);
            let seq = store.normalize_seq(raw_seq);
            match store.set_ack_by_sequence(seq, AckStatus::Confirmed) {
                Ok(true) => {
                    if let Some((contact, record)) = store.record_by_sequence(seq) {
                        info!("Ack confirmed for {} seq={}", contact, seq);
                        let _ = events.send(SessionEvent::Delivered {
                            contact: contact.to_string(),
                            timestamp: record.timestamp,
                        });
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to record ack for seq {}: {}", seq, e),
            }
        });
    }

    pub fn device(&self) -> &Arc<VlcDevice> {
        &self.device
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        self.device.start().await?;
        Ok(())
    }

    pub async fn stop(&self) {
        self.device.stop().await;
    }

    /// Record and send a message, then start its ack timeout. Invalid input and an
    /// unavailable device are rejected before anything is recorded.
    pub fn send_text(&self, contact: &str, text: &str) -> Result<MessageRecord, SessionError> {
        let state = self.device.state();
        if state != LinkState::Ready {
            return Err(DeviceError::NotReady(state).into());
        }
        let destination = encode_send(contact, text)
            .map_err(DeviceError::from)?
            .destination;

        let record = lock(&self.store).record_sent(
            &destination,
            text,
            None,
            AckStatus::Outstanding,
            None,
        )?;
        if let Err(e) = self.device.send(&destination, text, record.timestamp) {
            warn!("Send to {} failed: {}", destination, e);
            if let Err(store_err) =
                lock(&self.store).set_ack(&destination, record.timestamp, AckStatus::Failed)
            {
                warn!("Failed to mark message to {} as failed: {}", destination, store_err);
            }
            return Err(e.into());
        }
        info!("TX -> {}: {}", destination, preview(text));
        self.schedule_ack_timeout(destination, record.timestamp);
        Ok(record)
    }

    fn schedule_ack_timeout(&self, contact: String, timestamp: DateTime<Utc>) {
        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        let delay = self.ack_timeout;
        tokio::spawn(async move {
            sleep(delay).await;
            let failed = lock(&store).fail_pending_ack(&contact, timestamp);
            match failed {
                Ok(true) => {
                    warn!("ACK timeout for {} @ {}", contact, timestamp);
                    metrics::inc_ack_timeouts();
                    let _ = events.send(SessionEvent::TimedOut { contact, timestamp });
                }
                Ok(false) => {}
                Err(e) => warn!("Ack timeout check for {} failed: {}", contact, e),
            }
        });
    }
}

/// Store a received message. A sequence number already used elsewhere is
/// dropped rather than losing the message.
fn store_received(
    store: &SharedStore,
    contact: &str,
    text: &str,
    stats: Option<&LinkStats>,
) -> Option<MessageRecord> {
    let mut store = lock(store);
    let seq = stats.and_then(|s| s.seq).map(|raw| store.normalize_seq(raw));
    let result = match store.record_received(contact, text, None, seq) {
        Err(e) if e.is_consistency() => {
            warn!("{}; storing message from {} without it", e, contact);
            store.record_received(contact, text, None, None)
        }
        other => other,
    };
    match result {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Failed to store message from {}: {}", contact, e);
            None
        }
    }
}
