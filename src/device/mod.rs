//! # Link Protocol Engine
//!
//! Owns the serial connection to the optical modem: opens it, runs the
//! configuration handshake, keeps a reader task decoding device output and
//! correlates every acknowledgement with the oldest outstanding send to the
//! same destination.
//!
//! ```text
//! Stopped ──start()──▶ Configuring ──handshake ok──▶ Ready
//!    ▲                      │                          │
//!    └──────── error ───────┘◀──── stop() / read error ┘
//! ```
//!
//! ```rust,no_run
//! use vlcchat::config::DeviceConfig;
//! use vlcchat::device::VlcDevice;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let device = VlcDevice::serial(DeviceConfig::new("/dev/ttyACM0", "AB"));
//!     device.subscribe_ack(|contact, ts| println!("{} confirmed {}", contact, ts));
//!     device.start().await?;
//!     device.send("CD", "hello", chrono::Utc::now())?;
//!     device.stop().await;
//!     Ok(())
//! }
//! ```

pub mod pending;
pub mod port;
mod reader;
pub mod subscribers;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

pub use pending::PendingSends;
pub use port::{LinkPort, PortOpener, SharedPort};
pub use subscribers::Subscribers;

use crate::config::DeviceConfig;
use crate::logutil::preview;
use crate::metrics;
use crate::protocol::{encode_send, encode_set_address, DeviceSetting, EncodeError, LinkStats};
use crate::validation::{AddressError, TextError};
use port::write_command;
use reader::{ControlMessage, DeviceReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Stopped,
    Configuring,
    Ready,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::Stopped => "stopped",
            LinkState::Configuring => "configuring",
            LinkState::Ready => "ready",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid destination: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("invalid message text: {0}")]
    InvalidText(#[from] TextError),

    #[error("device is not ready (state: {0})")]
    NotReady(LinkState),

    #[error("cannot open serial port {port}: {reason}")]
    Connection { port: String, reason: String },

    #[error("serial io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EncodeError> for DeviceError {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::Address(e) => DeviceError::InvalidAddress(e),
            EncodeError::Text(e) => DeviceError::InvalidText(e),
        }
    }
}

impl DeviceError {
    /// Rejected input, as opposed to a link failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DeviceError::InvalidAddress(_) | DeviceError::InvalidText(_)
        )
    }
}

/// Lock a std mutex, recovering the data if a handler panicked while holding it.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared with the reader task
pub(crate) struct LinkShared {
    state: Mutex<LinkState>,
    pending: Mutex<PendingSends>,
    port: Mutex<Option<SharedPort>>,
    subscribers: Subscribers,
}

impl LinkShared {
    fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("Link state {} -> {}", *current, state);
            *current = state;
        }
    }
}

struct RunningReader {
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    handle: JoinHandle<()>,
}

impl RunningReader {
    async fn shutdown(mut self, limit: Duration) {
        let _ = self.control_tx.send(ControlMessage::Shutdown);
        match timeout(limit, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Reader task ended abnormally: {}", e),
            Err(_) => {
                warn!("Reader task did not stop within {:?}; aborting it", limit);
                self.handle.abort();
            }
        }
    }
}

pub struct VlcDevice {
    config: DeviceConfig,
    opener: PortOpener,
    shared: Arc<LinkShared>,
    running: tokio::sync::Mutex<Option<RunningReader>>,
}

impl VlcDevice {
    /// Device on the serial port named in `config`.
    pub fn serial(config: DeviceConfig) -> Self {
        Self::with_opener(config, Box::new(port::open_serial))
    }

    /// Device whose port comes from `opener`, e.g. an in-memory port in tests.
    pub fn with_opener(config: DeviceConfig, opener: PortOpener) -> Self {
        Self {
            config,
            opener,
            shared: Arc::new(LinkShared {
                state: Mutex::new(LinkState::Stopped),
                pending: Mutex::new(PendingSends::new()),
                port: Mutex::new(None),
                subscribers: Subscribers::default(),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    pub fn subscribe_message<F>(&self, handler: F)
    where
        F: Fn(&str, &str, Option<&LinkStats>) + Send + Sync + 'static,
    {
        self.shared.subscribers.add_message(Arc::new(handler));
    }

    pub fn subscribe_ack<F>(&self, handler: F)
    where
        F: Fn(&str, DateTime<Utc>) + Send + Sync + 'static,
    {
        self.shared.subscribers.add_ack(Arc::new(handler));
    }

    pub fn subscribe_stats<F>(&self, handler: F)
    where
        F: Fn(&LinkStats) + Send + Sync + 'static,
    {
        self.shared.subscribers.add_stats(Arc::new(handler));
    }

    pub fn subscribe_sequence<F>(&self, handler: F)
    where
        F: Fn(&str, u32, DateTime<Utc>) + Send + Sync + 'static,
    {
        self.shared.subscribers.add_sequence(Arc::new(handler));
    }

    /// Configuration commands in the order they are sent after `a[MAC]`.
    pub fn settings(&self) -> Vec<DeviceSetting> {
        let mut settings = vec![
            DeviceSetting::Retransmissions(self.config.n_retransmissions),
            DeviceSetting::FecThreshold(self.config.fec_threshold),
            DeviceSetting::ChannelBusyThreshold(self.config.channel_busy_threshold),
        ];
        if let Some(level) = self.config.log_level {
            settings.push(DeviceSetting::LogLevel(level));
        }
        settings
    }

    /// Open the port, configure the device and start the reader. No-op when
    /// already ready.
    pub async fn start(&self) -> Result<(), DeviceError> {
        let mut running = self.running.lock().await;
        if self.state() == LinkState::Ready {
            debug!("Device already running");
            return Ok(());
        }
        // a reader that died on a read error is still around
        if let Some(stale) = running.take() {
            stale.shutdown(self.config.stop_timeout()).await;
        }

        self.shared.set_state(LinkState::Configuring);
        let port = match self.configure().await {
            Ok(port) => port,
            Err(e) => {
                lock(&self.shared.port).take();
                self.shared.set_state(LinkState::Stopped);
                return Err(e);
            }
        };

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let reader = DeviceReader::new(
            port.clone(),
            Arc::clone(&self.shared),
            control_rx,
            self.config.receive_stats_grace(),
        );
        lock(&self.shared.pending).clear();
        *lock(&self.shared.port) = Some(port);
        self.shared.set_state(LinkState::Ready);
        let handle = tokio::spawn(reader.run());
        *running = Some(RunningReader { control_tx, handle });
        info!("Device {} ready on {}", self.config.mac, self.config.port);
        Ok(())
    }

    async fn configure(&self) -> Result<SharedPort, DeviceError> {
        info!(
            "Opening {} at {} baud",
            self.config.port, self.config.baud_rate
        );
        let port: SharedPort = Arc::new(Mutex::new((self.opener)(&self.config)?));
        sleep(self.config.startup_settle()).await;

        let mut commands = vec![encode_set_address(&self.config.mac)?];
        commands.extend(self.settings().iter().map(DeviceSetting::encode));
        for command in commands {
            debug!(
                "Config command: {}",
                String::from_utf8_lossy(&command).trim_end()
            );
            write_command(&port, &command)?;
            sleep(self.config.command_gap()).await;
        }

        // boot banner and command echoes
        lock(&port).clear_input()?;
        Ok(port)
    }

    /// Stop the reader and close the port. Safe to call repeatedly.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(reader) = running.take() {
            reader.shutdown(self.config.stop_timeout()).await;
        }
        lock(&self.shared.port).take();
        if self.state() != LinkState::Stopped {
            info!("Device stopped");
        }
        self.shared.set_state(LinkState::Stopped);
    }

    /// Send `text` to `destination`. `timestamp` identifies the message when its
    /// acknowledgement arrives. Invalid input is rejected before anything is written.
    pub fn send(
        &self,
        destination: &str,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), DeviceError> {
        let state = self.state();
        if state != LinkState::Ready {
            return Err(DeviceError::NotReady(state));
        }
        let encoded = encode_send(destination, text)?;
        let port = lock(&self.shared.port)
            .clone()
            .ok_or(DeviceError::NotReady(LinkState::Stopped))?;

        // queued before the write so a fast ack always finds its entry
        lock(&self.shared.pending).push(&encoded.destination, timestamp);
        if let Err(e) = write_command(&port, &encoded.bytes) {
            lock(&self.shared.pending).retract(&encoded.destination, timestamp);
            return Err(e.into());
        }
        info!("TX to {}: {}", encoded.destination, preview(text));
        metrics::inc_messages_sent();
        Ok(())
    }

    /// Sends to `destination` still waiting for an acknowledgement.
    pub fn pending_acks(&self, destination: &str) -> usize {
        lock(&self.shared.pending).outstanding(destination)
    }
}
