//! Configuration constants and transport settings for the Nordic serial DFU protocol.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Serial Communication
// ============================================================================

/// Default baud rate for DFU communication with the bootloader.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default number of data frames between packet receipt notifications.
pub const DEFAULT_PRN: u16 = 10;

/// Default wait for a single response or acknowledgment.
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;

/// Default window for opening the port and completing the handshake.
pub const DEFAULT_OPEN_TIMEOUT_MS: u64 = 30_000;

/// Size of the payload carried by one WriteObject frame.
///
/// Sized to fit the bootloader's receive buffer once SLIP escaping has been
/// applied. Not negotiated at runtime.
pub const DATA_CHUNK_SIZE: usize = 128;

/// Serial read timeout used when the port is first opened.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(1000);

// ============================================================================
// Retry Configuration
// ============================================================================

/// Attempts made for one acknowledgment before giving up.
pub const MAX_ACK_ATTEMPTS: u32 = 3;

/// Attempts made to open the port when the driver reports a transient error.
pub const MAX_OPEN_RETRIES: u32 = 10;

/// Delay between port open attempts.
pub const OPEN_RETRY_DELAY: Duration = Duration::from_millis(200);

// ============================================================================
// SLIP Protocol Constants
// ============================================================================

/// SLIP frame delimiter (END byte).
pub const SLIP_END: u8 = 0xC0;

/// SLIP escape byte.
pub const SLIP_ESC: u8 = 0xDB;

/// SLIP escaped END (0xC0 encoded as 0xDB 0xDC).
pub const SLIP_ESC_END: u8 = 0xDC;

/// SLIP escaped ESC (0xDB encoded as 0xDB 0xDD).
pub const SLIP_ESC_ESC: u8 = 0xDD;

/// Maximum decoded frame accepted from the device.
pub const MAX_SLIP_FRAME_SIZE: usize = 1536;

// ============================================================================
// DFU Opcodes
// ============================================================================

/// Request opcodes understood by the serial DFU bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuOpcode {
    /// Create a command or data object of a given size
    CreateObject = 0x01,
    /// Set the packet receipt notification interval
    SetPrn = 0x02,
    /// Report offset and CRC32 of the data received so far
    CalcChecksum = 0x03,
    /// Execute (commit) the current object
    Execute = 0x04,
    /// Select an object type and report its limits and state
    SelectObject = 0x06,
    /// Write object payload
    WriteObject = 0x08,
    /// Handshake
    Ping = 0x09,
    /// Response marker, first byte of every device frame
    Response = 0x60,
}

impl DfuOpcode {
    /// Parse an opcode from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DfuOpcode::CreateObject),
            0x02 => Some(DfuOpcode::SetPrn),
            0x03 => Some(DfuOpcode::CalcChecksum),
            0x04 => Some(DfuOpcode::Execute),
            0x06 => Some(DfuOpcode::SelectObject),
            0x08 => Some(DfuOpcode::WriteObject),
            0x09 => Some(DfuOpcode::Ping),
            0x60 => Some(DfuOpcode::Response),
            _ => None,
        }
    }
}

/// Object types addressed by Select/Create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    /// Init packet
    Command = 0x01,
    /// Firmware image
    Data = 0x02,
}

/// Result codes reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuResultCode {
    Invalid = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtendedError = 0x0B,
}

impl DfuResultCode {
    /// Parse a result code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(DfuResultCode::Invalid),
            0x01 => Some(DfuResultCode::Success),
            0x02 => Some(DfuResultCode::OpCodeNotSupported),
            0x03 => Some(DfuResultCode::InvalidParameter),
            0x04 => Some(DfuResultCode::InsufficientResources),
            0x05 => Some(DfuResultCode::InvalidObject),
            0x07 => Some(DfuResultCode::UnsupportedType),
            0x08 => Some(DfuResultCode::OperationNotPermitted),
            0x0A => Some(DfuResultCode::OperationFailed),
            0x0B => Some(DfuResultCode::ExtendedError),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            DfuResultCode::Invalid => "Invalid opcode",
            DfuResultCode::Success => "Operation successful",
            DfuResultCode::OpCodeNotSupported => "Opcode not supported",
            DfuResultCode::InvalidParameter => "Missing or invalid parameter value",
            DfuResultCode::InsufficientResources => "Not enough memory for the data object",
            DfuResultCode::InvalidObject => "Data object does not match the firmware requirements",
            DfuResultCode::UnsupportedType => "Not a valid object type for a Create request",
            DfuResultCode::OperationNotPermitted => "Operation not permitted in the current state",
            DfuResultCode::OperationFailed => "Operation failed",
            DfuResultCode::ExtendedError => "Extended error",
        }
    }
}

/// Describe a raw result byte, including codes this host does not know.
pub fn describe_result(byte: u8) -> &'static str {
    DfuResultCode::from_byte(byte)
        .map(|code| code.description())
        .unwrap_or("Unknown result code")
}

// ============================================================================
// Transport Configuration
// ============================================================================

/// Serial flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(mode: FlowControl) -> Self {
        match mode {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// Everything the transport needs to open and drive one serial session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Serial port path (e.g., "/dev/ttyACM0" or "COM3").
    pub port: String,
    pub baud_rate: u32,
    pub flow_control: FlowControl,
    /// Data frames per acknowledgment. 0 checks only at the end of each object.
    pub prn: u16,
    /// Validate the peer with a ping round-trip after opening.
    pub ping: bool,
    /// Wait for one response or acknowledgment.
    pub timeout_ms: u64,
    /// Window for opening the port and completing the handshake.
    pub open_timeout_ms: u64,
    /// Wait after the first open, before the handshake.
    pub connect_delay_ms: Option<u64>,
    /// Plain text written once before any framed traffic to enter DFU mode.
    pub dfu_trigger: Option<String>,
    /// Payload bytes per WriteObject frame.
    pub chunk_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            flow_control: FlowControl::None,
            prn: DEFAULT_PRN,
            ping: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            open_timeout_ms: DEFAULT_OPEN_TIMEOUT_MS,
            connect_delay_ms: None,
            dfu_trigger: None,
            chunk_size: DATA_CHUNK_SIZE,
        }
    }
}

impl TransportConfig {
    /// Default configuration for the given port.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn connect_delay(&self) -> Option<Duration> {
        self.connect_delay_ms.map(Duration::from_millis)
    }
}
