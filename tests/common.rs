//! Test utilities & fixtures.
//! Provides an in-memory modem port and fast device settings.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vlcchat::config::DeviceConfig;
use vlcchat::device::{DeviceError, LinkPort, PortOpener};

#[derive(Default)]
struct MockState {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    fail_reads: bool,
    fail_writes: bool,
    clears: usize,
}

/// Scripted modem: lines fed with [`MockPort::feed`] are returned by reads,
/// everything written is captured.
#[derive(Clone, Default)]
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, data: &str) {
        self.state.lock().unwrap().inbound.extend(data.as_bytes());
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().unwrap().written).into_owned()
    }

    pub fn clear_written(&self) {
        self.state.lock().unwrap().written.clear();
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().unwrap().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    pub fn clears(&self) -> usize {
        self.state.lock().unwrap().clears
    }

    pub fn opener(&self) -> PortOpener {
        let port = self.clone();
        Box::new(move |_config: &DeviceConfig| -> Result<Box<dyn LinkPort>, DeviceError> {
            Ok(Box::new(port.clone()))
        })
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reads {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        if state.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LinkPort for MockPort {
    fn clear_input(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.inbound.clear();
        state.clears += 1;
        Ok(())
    }
}

/// Device settings for local address `AA` with every delay removed.
pub fn fast_config() -> DeviceConfig {
    let mut config = DeviceConfig::new("mock", "AA");
    config.startup_settle_ms = 0;
    config.command_gap_ms = 0;
    config.read_timeout_ms = 10;
    config.receive_stats_grace_ms = 2000;
    config.stop_timeout_ms = 500;
    config
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Thread-safe collector for callback arguments.
pub fn collector<T>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}
