//! Nordic serial DFU (Device Firmware Update) for nRF5x bootloaders.
//!
//! # Protocol Overview
//!
//! A DFU run consists of:
//! 1. **Package** - Unpack the zip and parse `manifest.json`
//! 2. **DFU entry** - Optionally write a trigger string to the application
//! 3. **Per image** - Open a session, send the init packet (command object),
//!    stream the firmware (data objects) and close
//! 4. **Verification** - Every acknowledgment carries the device's offset and
//!    CRC32, checked against what was sent
//!
//! Images are sent SoftDevice first, then bootloader, then application.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::mpsc;
//! use nrf_serial_dfu::dfu::{unpack_and_parse, DfuOrchestrator, SerialTransport, TransportConfig};
//!
//! let package = unpack_and_parse("app_dfu_package.zip", "/tmp/dfu-unpacked")?;
//! let transport = SerialTransport::new(TransportConfig::new("/dev/ttyACM0"));
//! let (tx, rx) = mpsc::channel();
//!
//! std::thread::spawn(move || {
//!     for event in rx {
//!         println!("{}", event.message());
//!     }
//! });
//!
//! DfuOrchestrator::new(package, transport, tx).send_images()?;
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod manifest;
pub mod orchestrator;
pub mod package;
pub mod packet;
pub mod slip;
pub mod transport;

pub use config::{FlowControl, TransportConfig};
pub use error::{
    DfuError, DfuResult, PackageError, PackageResult, TransferStage, TransportError,
    TransportResult, TransportState,
};
pub use manifest::{Component, ComponentKind, InitPacketData, Manifest, MANIFEST_FILENAME};
pub use orchestrator::{DfuEvent, DfuOrchestrator};
pub use package::{unpack_and_parse, FirmwareImage, Package};
pub use transport::{DfuTransport, ProgressCallback, SerialTransport};
