//! Byte-level serial link underneath the DFU transport.
//!
//! Provides a trait-based abstraction over the serial port,
//! enabling both real hardware and a simulated bootloader in tests.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, warn};

use super::config::{FlowControl, MAX_OPEN_RETRIES, OPEN_RETRY_DELAY, SERIAL_READ_TIMEOUT};
use super::error::{TransportError, TransportResult};

/// Raw byte link to the device.
pub trait SerialLink: Send {
    /// Write all of `data` to the link.
    fn write(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Read available bytes, waiting at most `timeout`.
    ///
    /// Returns 0 when nothing arrived in time.
    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> TransportResult<usize>;

    /// Flush any buffered output.
    fn flush(&mut self) -> TransportResult<()>;

    /// Clear any pending input data from the receive buffer.
    fn clear_input(&mut self) -> TransportResult<()>;
}

/// Serial port link implementation.
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
}

impl SerialPortLink {
    /// Open a serial port with the given baud rate and flow control.
    ///
    /// Retries transient failures seen while a device re-enumerates after
    /// reset (the port is listed before the driver is ready).
    pub fn open(port_name: &str, baud_rate: u32, flow_control: FlowControl) -> TransportResult<Self> {
        let normalized_name = normalize_port_name(port_name);
        let mut last_error: Option<serialport::Error> = None;

        for attempt in 0..MAX_OPEN_RETRIES {
            match serialport::new(&normalized_name, baud_rate)
                .timeout(SERIAL_READ_TIMEOUT)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(flow_control.into())
                .open()
            {
                Ok(port) => {
                    let mut link = Self { port };
                    // Stale bytes from a previous session would desync the first response
                    link.clear_input().ok();
                    debug!(port = %normalized_name, baud_rate, ?flow_control, "serial port opened");
                    return Ok(link);
                }
                Err(e) => {
                    let err_str = e.to_string().to_lowercase();

                    // - "not functioning": Windows driver not ready after USB re-enumeration
                    // - "resource temporarily unavailable": Device briefly unavailable
                    // - "interrupted": Operation interrupted, may succeed on retry
                    let is_transient = err_str.contains("not functioning")
                        || err_str.contains("temporarily unavailable")
                        || err_str.contains("interrupted");

                    if is_transient && attempt < MAX_OPEN_RETRIES - 1 {
                        warn!(port = %normalized_name, attempt, error = %e, "transient open failure, retrying");
                        std::thread::sleep(OPEN_RETRY_DELAY);
                        last_error = Some(e);
                        continue;
                    }

                    return Err(port_unavailable(port_name, &e));
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "retries exhausted".to_string());
        Err(TransportError::PortUnavailable {
            port: port_name.to_string(),
            reason,
        })
    }
}

/// Map an open failure onto the single "port unavailable" error.
fn port_unavailable(port_name: &str, error: &serialport::Error) -> TransportError {
    let reason = match error.kind() {
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            "permission denied".to_string()
        }
        serialport::ErrorKind::NoDevice | serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            "no such device".to_string()
        }
        _ => {
            let text = error.to_string();
            let lower = text.to_lowercase();
            if lower.contains("busy") || lower.contains("in use") {
                "busy or in use by another application".to_string()
            } else {
                text
            }
        }
    };

    TransportError::PortUnavailable {
        port: port_name.to_string(),
        reason,
    }
}

impl SerialLink for SerialPortLink {
    fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        // The OS handles USB packetization; write_all handles partial writes.
        self.port.write_all(data)?;
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        self.port.set_timeout(timeout)?;

        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn flush(&mut self) -> TransportResult<()> {
        self.port.flush()?;
        Ok(())
    }

    fn clear_input(&mut self) -> TransportResult<()> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

/// Normalize a port name for cross-platform compatibility.
fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        // Prefer cu. over tty. (tty. blocks waiting for DCD)
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need \\.\\ prefix
        if name.starts_with("COM") {
            if let Ok(n) = name[3..].parse::<u32>() {
                if n > 9 {
                    return format!("\\\\.\\{}", name);
                }
            }
        }
    }

    name.to_string()
}
