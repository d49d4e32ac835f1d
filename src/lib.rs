//! # vlcchat - Text Chat over an Optical Link Modem
//!
//! vlcchat lets stations exchange short text messages through a visible light
//! communication modem attached over a serial port. The modem handles
//! retransmission and forward error correction; this crate frames outgoing
//! messages, decodes what the modem reports and keeps an accurate history of
//! which message each acknowledgement belongs to.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vlcchat::config::Config;
//! use vlcchat::device::VlcDevice;
//! use vlcchat::session::ChatSession;
//! use vlcchat::storage::ConversationStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let store = ConversationStore::open(&config.storage.history_file)?.into_shared();
//!     let device = Arc::new(VlcDevice::serial(config.device.clone()));
//!     let (session, mut events) = ChatSession::new(device, store, &config.session);
//!     session.start().await?;
//!     session.send_text("CD", "hello")?;
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`protocol`] - line protocol codec and serial line framing
//! - [`device`] - serial connection, configuration handshake and decode loop
//! - [`storage`] - conversation history with acknowledgement and sequence tracking
//! - [`session`] - wiring between device events and the history
//! - [`config`] - TOML configuration
//! - [`validation`] - address and message text rules
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  ChatSession    │ ← send, ack timeouts, event feed
//! └─────────────────┘
//!      │         │
//! ┌──────────┐ ┌──────────────────┐
//! │ VlcDevice│ │ConversationStore │
//! └──────────┘ └──────────────────┘
//!      │
//! ┌──────────┐
//! │ protocol │ ← a[..] c[..] m[..] s[..] lines
//! └──────────┘
//! ```

pub mod config;
pub mod device;
pub mod logutil;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod validation;
