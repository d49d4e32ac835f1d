//! Byte channel to the modem.
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

#[cfg(feature = "serial")]
use log::debug;

use super::DeviceError;
use crate::config::DeviceConfig;

/// A bidirectional byte stream to the device. Reads must time out rather than
/// block indefinitely; a timeout is reported as `TimedOut` or `WouldBlock`.
pub trait LinkPort: Read + Write + Send {
    /// Discard input received but not read yet.
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Port shared by the reader task and senders
pub type SharedPort = Arc<Mutex<Box<dyn LinkPort>>>;

/// Opens the port when the device starts.
pub type PortOpener =
    Box<dyn Fn(&DeviceConfig) -> Result<Box<dyn LinkPort>, DeviceError> + Send + Sync>;

#[cfg(feature = "serial")]
impl LinkPort for Box<dyn serialport::SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Open the configured serial port with the configured read timeout.
#[cfg(feature = "serial")]
pub fn open_serial(config: &DeviceConfig) -> Result<Box<dyn LinkPort>, DeviceError> {
    debug!(
        "Opening serial port {} at {} baud",
        config.port, config.baud_rate
    );
    let mut builder =
        serialport::new(config.port.as_str(), config.baud_rate).timeout(config.read_timeout());
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let port = builder.open().map_err(|e| DeviceError::Connection {
        port: config.port.clone(),
        reason: e.to_string(),
    })?;
    Ok(Box::new(port))
}

#[cfg(not(feature = "serial"))]
pub fn open_serial(config: &DeviceConfig) -> Result<Box<dyn LinkPort>, DeviceError> {
    Err(DeviceError::Connection {
        port: config.port.clone(),
        reason: "built without serial support".to_string(),
    })
}

pub(crate) fn write_command(port: &SharedPort, bytes: &[u8]) -> io::Result<()> {
    let mut port = super::lock(port);
    port.write_all(bytes)?;
    port.flush()
}
