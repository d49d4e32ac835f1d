use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::pending::{PendingReceive, PendingReceives};
use super::port::SharedPort;
use super::{lock, LinkShared, LinkState};
use crate::logutil::{escape_log, preview};
use crate::metrics;
use crate::protocol::framer::LineFramer;
use crate::protocol::{decode_line, DeviceEvent, LinkStats};
use crate::storage::format_timestamp;
use crate::validation::{is_broadcast, BROADCAST_ADDRESS};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub(crate) enum ControlMessage {
    Shutdown,
}

/// Decode loop: reads the port, frames lines and dispatches device events.
pub(crate) struct DeviceReader {
    port: SharedPort,
    shared: Arc<LinkShared>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    framer: LineFramer,
    receives: PendingReceives,
    receive_grace: Duration,
}

impl DeviceReader {
    pub(crate) fn new(
        port: SharedPort,
        shared: Arc<LinkShared>,
        control_rx: mpsc::UnboundedReceiver<ControlMessage>,
        receive_grace: Duration,
    ) -> Self {
        Self {
            port,
            shared,
            control_rx,
            framer: LineFramer::new(),
            receives: PendingReceives::default(),
            receive_grace,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Starting device reader task");
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                control_msg = self.control_rx.recv() => {
                    match control_msg {
                        Some(ControlMessage::Shutdown) => {
                            info!("Reader task received shutdown signal");
                            break;
                        }
                        None => {
                            warn!("Control channel closed, shutting down reader");
                            break;
                        }
                    }
                }

                _ = interval.tick() => {
                    if let Err(e) = self.read_and_process() {
                        error!("Serial read failed, stopping reader: {}", e);
                        metrics::inc_read_errors();
                        self.shared.set_state(LinkState::Stopped);
                        break;
                    }
                    let expired = self.receives.take_expired(Instant::now(), self.receive_grace);
                    self.deliver_unpaired(expired);
                }
            }
        }

        let leftover = self.receives.drain();
        self.deliver_unpaired(leftover);
        info!("Device reader task shutting down");
    }

    fn read_and_process(&mut self) -> std::io::Result<()> {
        let mut buffer = [0u8; 512];
        let read_result = {
            let mut port = lock(&self.port);
            port.read(&mut buffer)
        };

        match read_result {
            Ok(0) => {}
            Ok(bytes_read) => {
                trace!("RAW {} bytes", bytes_read);
                self.framer.push(&buffer[..bytes_read]);
                while let Some(line) = self.framer.next_line() {
                    self.dispatch(&line);
                }
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                // no data this round
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {
                warn!("Serial read interrupted, retrying");
                metrics::inc_read_errors();
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn dispatch(&mut self, line: &str) {
        trace!("RX line: {}", escape_log(line, 240));
        match decode_line(line) {
            DeviceEvent::Message { source, payload } => {
                debug!("Buffered message from {} awaiting statistics", source);
                self.receives.push(source, payload, Instant::now());
            }
            DeviceEvent::Ack { mac, success } => self.handle_ack(&mac, success),
            DeviceEvent::Stats(stats) => self.handle_stats(&stats),
            DeviceEvent::Discard(line) => {
                if !line.is_empty() {
                    debug!("Discarding unrecognised line: {}", escape_log(&line, 120));
                    metrics::inc_discarded_lines();
                }
            }
        }
    }

    fn handle_ack(&mut self, mac: &str, success: bool) {
        let popped = lock(&self.shared.pending).pop_ack(mac);
        match (popped, success) {
            (Some(timestamp), true) => {
                info!(
                    "Ack from {} for message sent at {}",
                    mac,
                    format_timestamp(&timestamp)
                );
                metrics::inc_acks_confirmed();
                self.shared.subscribers.notify_ack(mac, timestamp);
            }
            (Some(timestamp), false) => {
                warn!(
                    "Device dropped message to {} sent at {}",
                    mac,
                    format_timestamp(&timestamp)
                );
                metrics::inc_acks_dropped();
            }
            (None, _) => {
                warn!("Ack from {} with no outstanding send; ignoring", mac);
                metrics::inc_acks_unmatched();
            }
        }
    }

    fn handle_stats(&mut self, stats: &LinkStats) {
        metrics::inc_stats_lines();

        // acknowledgement statistics describe our own traffic, not a payload
        if stats.is_receive() && !stats.is_ack() {
            if let Some(receive) = self.receives.pop_oldest() {
                let contact = match stats.destination.as_deref() {
                    Some(dest) if is_broadcast(dest) => BROADCAST_ADDRESS.to_string(),
                    _ => receive.source.clone(),
                };
                info!("RX from {} as {}: {}", receive.source, contact, preview(&receive.payload));
                metrics::inc_receives_paired();
                self.shared
                    .subscribers
                    .notify_message(&contact, &receive.payload, Some(stats));
            }
        }

        if stats.is_transmit() && stats.is_data() {
            if let (Some(dest), Some(seq)) = (stats.destination.as_deref(), stats.seq) {
                let assigned = lock(&self.shared.pending).assign_sequence(dest, seq);
                if let Some(timestamp) = assigned {
                    debug!(
                        "Sequence {} assigned to message for {} sent at {}",
                        seq,
                        dest,
                        format_timestamp(&timestamp)
                    );
                    self.shared.subscribers.notify_sequence(dest, seq, timestamp);
                }
            }
        }

        self.shared.subscribers.notify_stats(stats);
    }

    fn deliver_unpaired(&self, receives: Vec<PendingReceive>) {
        for receive in receives {
            info!(
                "RX from {} without statistics: {}",
                receive.source,
                preview(&receive.payload)
            );
            metrics::inc_receives_unpaired();
            self.shared
                .subscribers
                .notify_message(&receive.source, &receive.payload, None);
        }
    }
}
