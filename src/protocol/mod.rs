//! # Optical Link Device Wire Protocol
//!
//! The device speaks a line-oriented ASCII protocol over its serial port. Every
//! command and every event is a single line of the form `x[field,field,...]`.
//!
//! ## Host → device
//!
//! | Line | Meaning |
//! |---|---|
//! | `a[MAC]` | set the device address |
//! | `c[1,0,N]` | retransmission count |
//! | `c[0,1,T]` | FEC threshold (never below 10) |
//! | `c[0,2,B]` | channel-busy threshold |
//! | `c[2,0,L]` | device log level (optional) |
//! | `m[<text>\0,DEST]` | send a message |
//!
//! ## Device → host
//!
//! | Line | Event |
//! |---|---|
//! | `m[R,SRC,text]` | [`DeviceEvent::Message`] |
//! | `m[P,0/1,MAC]` | [`DeviceEvent::Ack`] |
//! | `s[mode,type,SRC->DST,size(tx),seq,cw,cwsize,dispatchMs,tsMs]` | [`DeviceEvent::Stats`] |
//!
//! Everything else decodes to [`DeviceEvent::Discard`]. Decoding never fails:
//! malformed statistics sub-fields simply come out as `None`.
//!
//! The codec is stateless; line assembly from raw serial chunks lives in
//! [`framer`].

pub mod framer;

use serde::Serialize;

use crate::validation::{
    normalize_address, validate_charset, validate_payload_len, AddressError, TextError,
};

/// Separator between source and destination in the statistics path field.
pub const PATH_SEPARATOR: &str = "->";

/// Smallest FEC threshold the device accepts.
pub const MIN_FEC_THRESHOLD: u32 = 10;

/// Errors produced while encoding an outgoing message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("invalid destination: {0}")]
    Address(#[from] AddressError),

    #[error("invalid message text: {0}")]
    Text(#[from] TextError),
}

/// Device configuration commands sent during the startup handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSetting {
    Retransmissions(u32),
    FecThreshold(u32),
    ChannelBusyThreshold(u32),
    LogLevel(u8),
}

impl DeviceSetting {
    /// `(group, index, value)` triple of the `c[...]` command.
    pub fn triple(&self) -> (u8, u8, u32) {
        match *self {
            DeviceSetting::Retransmissions(n) => (1, 0, n),
            DeviceSetting::FecThreshold(t) => (0, 1, t.max(MIN_FEC_THRESHOLD)),
            DeviceSetting::ChannelBusyThreshold(b) => (0, 2, b),
            DeviceSetting::LogLevel(l) => (2, 0, u32::from(l)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (group, index, value) = self.triple();
        format!("c[{},{},{}]\n", group, index, value).into_bytes()
    }
}

/// Encode the `a[MAC]` command.
pub fn encode_set_address(mac: &str) -> Result<Vec<u8>, AddressError> {
    let mac = normalize_address(mac)?;
    Ok(format!("a[{}]\n", mac).into_bytes())
}

/// A message command ready to be written to the port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSend {
    /// Normalized destination address
    pub destination: String,
    pub bytes: Vec<u8>,
}

/// Encode `m[<escaped-text>\0,DEST]\n`.
///
/// The text must be 7-bit clean and the escaped payload plus its NUL terminator
/// must fit the device's 200 character buffer. The limit applies to the escaped
/// length, so each backslash, newline, carriage return or tab in `text` counts twice.
pub fn encode_send(destination: &str, text: &str) -> Result<EncodedSend, EncodeError> {
    let destination = normalize_address(destination)?;
    validate_charset(text)?;
    let payload = escape_payload(text);
    validate_payload_len(&payload)?;
    let bytes = format!("m[{}\0,{}]\n", payload, destination).into_bytes();
    Ok(EncodedSend { destination, bytes })
}

/// Escape the characters that would break the single-line framing.
pub fn escape_payload(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`escape_payload`] and drop NUL markers, both raw `\0` bytes and the
/// escaped `\0` sequence. Unknown escapes are kept verbatim.
pub fn unescape_payload(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\0' => {}
            '\\' => match chars.next() {
                Some('\\') => out.push('\\'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('0') => {}
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            },
            c => out.push(c),
        }
    }
    out
}

/// Statistics reported by the device for every transmission and reception.
///
/// Only `mode` and `kind` are mandatory; every other field is `None` when it is
/// missing or does not parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkStats {
    pub mode: String,
    pub kind: String,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub size: Option<u32>,
    pub tx_size: Option<u32>,
    pub seq: Option<u32>,
    pub cw: Option<u32>,
    pub cw_size: Option<u32>,
    pub dispatch_ms: Option<f64>,
    pub timestamp_ms: Option<f64>,
}

impl LinkStats {
    pub fn is_receive(&self) -> bool {
        self.mode.eq_ignore_ascii_case("R")
    }

    pub fn is_transmit(&self) -> bool {
        self.mode.eq_ignore_ascii_case("T")
    }

    pub fn is_ack(&self) -> bool {
        self.kind.eq_ignore_ascii_case("A")
    }

    pub fn is_data(&self) -> bool {
        self.kind.eq_ignore_ascii_case("D")
    }
}

/// A decoded device line
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Inbound text message; the payload is already unescaped.
    Message { source: String, payload: String },
    /// Delivery confirmation (`success`) or drop for the oldest send to `mac`.
    Ack { mac: String, success: bool },
    Stats(LinkStats),
    /// Anything unrecognised, carrying the trimmed line.
    Discard(String),
}

/// Classify one line read from the device.
pub fn decode_line(line: &str) -> DeviceEvent {
    let line = line.trim();
    if let Some(body) = bracket_body(line, "m[") {
        return decode_message(body).unwrap_or_else(|| DeviceEvent::Discard(line.to_string()));
    }
    if let Some(body) = bracket_body(line, "s[") {
        return parse_stats(body)
            .map(DeviceEvent::Stats)
            .unwrap_or_else(|| DeviceEvent::Discard(line.to_string()));
    }
    DeviceEvent::Discard(line.to_string())
}

fn bracket_body<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix)?.strip_suffix(']')
}

fn decode_message(body: &str) -> Option<DeviceEvent> {
    let mut parts = body.splitn(3, ',');
    let tag = parts.next()?.trim();
    let second = parts.next()?.trim();
    let third = parts.next()?;
    match tag {
        "R" => Some(DeviceEvent::Message {
            source: normalize_address(second).ok()?,
            payload: unescape_payload(third),
        }),
        "P" => {
            let success = match second {
                "1" => true,
                "0" => false,
                _ => return None,
            };
            Some(DeviceEvent::Ack {
                mac: normalize_address(third).ok()?,
                success,
            })
        }
        _ => None,
    }
}

/// Parse the body of an `s[...]` line. Returns `None` only when the two
/// mandatory leading fields are missing.
pub fn parse_stats(body: &str) -> Option<LinkStats> {
    let fields: Vec<&str> = body.split(',').map(str::trim).collect();
    if fields.len() < 2 || fields[0].is_empty() || fields[1].is_empty() {
        return None;
    }
    let field = |i: usize| fields.get(i).copied().filter(|f| !f.is_empty());

    let mut stats = LinkStats {
        mode: fields[0].to_string(),
        kind: fields[1].to_string(),
        ..LinkStats::default()
    };
    if let Some(path) = field(2) {
        let (source, destination) = parse_path(path);
        stats.source = source;
        stats.destination = destination;
    }
    if let Some(size) = field(3) {
        let (size, tx_size) = parse_size(size);
        stats.size = size;
        stats.tx_size = tx_size;
    }
    stats.seq = field(4).and_then(|f| f.parse().ok());
    stats.cw = field(5).and_then(|f| f.parse().ok());
    stats.cw_size = field(6).and_then(|f| f.parse().ok());
    stats.dispatch_ms = field(7).and_then(parse_float);
    stats.timestamp_ms = field(8).and_then(parse_float);
    Some(stats)
}

fn parse_path(path: &str) -> (Option<String>, Option<String>) {
    match path.split_once(PATH_SEPARATOR) {
        Some((src, dst)) => (normalize_address(src).ok(), normalize_address(dst).ok()),
        None => (None, None),
    }
}

/// `12(15)` → `(Some(12), Some(15))`, `12` → `(Some(12), None)`.
fn parse_size(raw: &str) -> (Option<u32>, Option<u32>) {
    match raw.split_once('(') {
        Some((size, rest)) => {
            let tx = rest
                .strip_suffix(')')
                .and_then(|inner| inner.trim().parse().ok());
            (size.trim().parse().ok(), tx)
        }
        None => (raw.parse().ok(), None),
    }
}

fn parse_float(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}
