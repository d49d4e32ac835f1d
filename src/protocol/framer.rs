//! Newline framer for the device's serial output.
//!
//! Serial reads return arbitrary chunks: half a line, several lines, or a line
//! split across three reads. [`LineFramer`] accumulates chunks and yields whole
//! lines with the `\n` (and an optional preceding `\r`) removed.
use bytes::{Buf, BytesMut};

/// Upper bound for a single line; the longest legitimate line is a 200 character
/// payload plus framing, so anything this long is line noise.
const MAX_LINE_LEN: usize = 4096;

pub struct LineFramer {
    buf: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_LINE_LEN && !self.buf.contains(&b'\n') {
            log::debug!(
                "Dropping {} buffered bytes without line terminator",
                self.buf.len()
            );
            self.buf.clear();
        }
    }

    /// Next complete line, if any. Invalid UTF-8 is replaced rather than rejected so
    /// one corrupted byte cannot stall the stream.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line = self.buf.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Drop everything buffered, e.g. output produced while the device was being configured.
    pub fn clear(&mut self) {
        let len = self.buf.remaining();
        self.buf.advance(len);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
