//! Error types for package loading, the serial transport and the DFU orchestrator.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use super::manifest::ComponentKind;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type alias for package operations.
pub type PackageResult<T> = Result<T, PackageError>;

/// Result type alias for whole DFU runs.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors raised while validating, unpacking and parsing a DFU package.
#[derive(Debug, Error)]
pub enum PackageError {
    /// The package archive does not exist or is not a file.
    #[error("Package {path} not found")]
    NotFound { path: PathBuf },

    /// The directory that should contain the unpacked package is unusable.
    #[error("Invalid destination {path}: {reason}")]
    InvalidDestination { path: PathBuf, reason: String },

    /// The unpack directory already exists. Never merged into.
    #[error("Target directory {path} exists, not able to unpack to that directory")]
    DestinationExists { path: PathBuf },

    /// The archive container could not be read.
    #[error("Invalid package archive: {0}")]
    InvalidArchive(#[from] zip::result::ZipError),

    /// Invalid or malformed manifest.json.
    #[error("Invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackageError {
    pub(crate) fn invalid_manifest(reason: impl Into<String>) -> Self {
        PackageError::InvalidManifest {
            reason: reason.into(),
        }
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            PackageError::NotFound { .. } => "DFU-040",
            PackageError::InvalidDestination { .. } => "DFU-042",
            PackageError::DestinationExists { .. } => "DFU-043",
            PackageError::InvalidArchive(_) => "DFU-003",
            PackageError::InvalidManifest { .. } => "DFU-041",
            PackageError::Io(_) => "DFU-002",
        }
    }
}

/// Errors raised by the serial transport engine.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Serial port could not be opened (missing, busy or permission denied).
    #[error("Port '{port}' unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    /// No handshake response within the open window.
    #[error("No ping response within {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    /// The device answered the handshake with a different identifier.
    #[error("Ping mismatch: expected id {expected}, got {actual}")]
    HandshakeMismatch { expected: u8, actual: u8 },

    /// An acknowledgment did not arrive after every allowed attempt.
    #[error("Timeout waiting for acknowledgment after {attempts} attempts")]
    TransferTimeout { attempts: u32 },

    /// A window's acknowledgment did not arrive in time. The window is resent.
    #[error("Timeout waiting for acknowledgment")]
    AckTimeout,

    /// Timeout waiting for the response to a request. Fatal.
    #[error("Timeout waiting for response")]
    ResponseTimeout,

    /// Device reported a different offset than the bytes actually sent.
    #[error("Offset mismatch: sent {expected} bytes, device reports {actual}")]
    OffsetMismatch { expected: u32, actual: u32 },

    /// CRC32 of the data received by the device differs from what was sent.
    #[error("CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// DFU protocol returned an error response.
    #[error("Device rejected opcode 0x{opcode:02X}: {message} (result 0x{result:02X})")]
    DeviceError {
        opcode: u8,
        result: u8,
        message: &'static str,
    },

    /// Response frame was too short or answered a different request.
    #[error("Malformed response: {reason}")]
    MalformedResponse { reason: String },

    /// Init packet does not fit in the device's command object.
    #[error("Init packet of {size} bytes exceeds device limit of {max_size} bytes")]
    InitPacketTooLarge { size: usize, max_size: usize },

    /// Operation issued in the wrong session state.
    #[error("Cannot {operation} while transport is {state}")]
    InvalidState {
        operation: &'static str,
        state: TransportState,
    },

    /// Invalid SLIP escape sequence encountered during decoding.
    #[error("Invalid SLIP escape sequence")]
    InvalidSlipEscape,

    /// SLIP frame exceeded maximum allowed size (possible corrupted data stream).
    #[error("SLIP frame too large: {size} bytes exceeds maximum {max_size}")]
    SlipBufferOverflow { size: usize, max_size: usize },

    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Check if this error is retriable (transient errors that may succeed on retry).
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransportError::AckTimeout)
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Serial(_) => "DFU-001",
            TransportError::Io(_) => "DFU-002",
            TransportError::InvalidSlipEscape => "DFU-010",
            TransportError::SlipBufferOverflow { .. } => "DFU-012",
            TransportError::CrcMismatch { .. } => "DFU-020",
            TransportError::ResponseTimeout => "DFU-021",
            TransportError::AckTimeout => "DFU-022",
            TransportError::TransferTimeout { .. } => "DFU-023",
            TransportError::HandshakeTimeout { .. } => "DFU-024",
            TransportError::HandshakeMismatch { .. } => "DFU-025",
            TransportError::DeviceError { .. } => "DFU-030",
            TransportError::MalformedResponse { .. } => "DFU-031",
            TransportError::PortUnavailable { .. } => "DFU-052",
            TransportError::OffsetMismatch { .. } => "DFU-060",
            TransportError::InitPacketTooLarge { .. } => "DFU-061",
            TransportError::InvalidState { .. } => "DFU-062",
        }
    }
}

/// Lifecycle of a serial DFU session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Opening,
    Validated,
    Transferring,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Closed => "closed",
            TransportState::Opening => "opening",
            TransportState::Validated => "validated",
            TransportState::Transferring => "transferring",
        };
        f.write_str(name)
    }
}

/// Step of a component transfer that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    Open,
    InitPacket,
    Firmware,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStage::Open => "connect",
            TransferStage::InitPacket => "init packet",
            TransferStage::Firmware => "firmware",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by a complete DFU run.
#[derive(Debug, Error)]
pub enum DfuError {
    #[error(transparent)]
    Package(#[from] PackageError),

    /// A transport failure while transferring one component.
    #[error("{component} {stage} failed: {source}")]
    Component {
        component: ComponentKind,
        stage: TransferStage,
        #[source]
        source: TransportError,
    },

    /// Reading a component's image from the unpacked package failed.
    #[error("Failed to read {component} image {path}: {source}")]
    ImageRead {
        component: ComponentKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DfuError {
    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            DfuError::Package(e) => e.error_code(),
            DfuError::Component { source, .. } => source.error_code(),
            DfuError::ImageRead { .. } => "DFU-002",
        }
    }

    /// The component being transferred when the failure happened, if any.
    pub fn component(&self) -> Option<ComponentKind> {
        match self {
            DfuError::Component { component, .. } | DfuError::ImageRead { component, .. } => {
                Some(*component)
            }
            DfuError::Package(_) => None,
        }
    }
}
