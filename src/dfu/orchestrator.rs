//! Multi-image DFU sequencing.
//!
//! Sends every component of a package through a [`DfuTransport`], one
//! session per image, and reports progress as [`DfuEvent`]s over a channel.

use std::sync::mpsc::Sender;

use tracing::{info, warn};

use super::error::{DfuError, DfuResult, TransferStage, TransportError};
use super::manifest::{Component, ComponentKind};
use super::package::{FirmwareImage, Package};
use super::transport::DfuTransport;

/// Progress of a DFU run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuEvent {
    /// The DFU entry trigger was sent.
    EnteringDfuMode,
    Connecting { component: ComponentKind },
    SendingInit { component: ComponentKind },
    /// Firmware bytes acknowledged so far, counted across the whole package.
    Uploading {
        component: ComponentKind,
        sent: u64,
        total: u64,
    },
    ComponentComplete { component: ComponentKind },
    Complete,
}

impl DfuEvent {
    /// Overall completion, if this event moves it.
    pub fn percent(&self) -> Option<f32> {
        match self {
            DfuEvent::EnteringDfuMode => Some(0.0),
            DfuEvent::Uploading { sent, total, .. } => {
                if *total == 0 {
                    Some(0.0)
                } else {
                    Some((*sent as f32 / *total as f32 * 100.0).min(100.0))
                }
            }
            DfuEvent::Complete => Some(100.0),
            _ => None,
        }
    }

    /// Get a human-readable message for this event.
    pub fn message(&self) -> String {
        match self {
            DfuEvent::EnteringDfuMode => "Entering DFU mode...".into(),
            DfuEvent::Connecting { component } => format!("Connecting for {}...", component),
            DfuEvent::SendingInit { component } => {
                format!("Sending {} init packet...", component)
            }
            DfuEvent::Uploading { component, .. } => {
                let percent = self.percent().unwrap_or(0.0);
                format!("Uploading {}... {:.0}%", component, percent)
            }
            DfuEvent::ComponentComplete { component } => format!("{} complete", component),
            DfuEvent::Complete => "Update complete!".into(),
        }
    }
}

fn component_failed(
    component: ComponentKind,
    stage: TransferStage,
) -> impl FnOnce(TransportError) -> DfuError {
    move |source| DfuError::Component {
        component,
        stage,
        source,
    }
}

/// Sends the images of a package in dependency order.
pub struct DfuOrchestrator<T: DfuTransport> {
    package: Package,
    transport: T,
    events: Sender<DfuEvent>,
}

impl<T: DfuTransport> DfuOrchestrator<T> {
    pub fn new(package: Package, transport: T, events: Sender<DfuEvent>) -> Self {
        Self {
            package,
            transport,
            events,
        }
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Components to send, in order, with their firmware sizes.
    pub fn transfer_plan(&self) -> DfuResult<Vec<(ComponentKind, u64)>> {
        self.package
            .manifest()
            .components()
            .into_iter()
            .map(|component| -> DfuResult<(ComponentKind, u64)> {
                Ok((component.kind, self.package.binary_size(component)?))
            })
            .collect()
    }

    /// Total firmware bytes in the package.
    pub fn total_size(&self) -> DfuResult<u64> {
        Ok(self.transfer_plan()?.iter().map(|(_, size)| size).sum())
    }

    /// Send every component of the package to the device.
    ///
    /// Stops at the first failure. The transport is closed whenever this
    /// returns.
    pub fn send_images(&mut self) -> DfuResult<()> {
        let total = self.total_size()?;
        let components: Vec<Component> = self
            .package
            .manifest()
            .components()
            .into_iter()
            .cloned()
            .collect();

        self.enter_dfu_mode();

        let mut sent_before = 0u64;
        for component in &components {
            sent_before += self.send_image(component, sent_before, total)?;
        }

        info!(components = components.len(), bytes = total, "DFU complete");
        self.emit(DfuEvent::Complete);
        Ok(())
    }

    fn enter_dfu_mode(&mut self) {
        match self.transport.send_dfu_trigger() {
            Ok(true) => self.emit(DfuEvent::EnteringDfuMode),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to send DFU trigger, continuing"),
        }
    }

    /// Send one component and return its firmware size.
    fn send_image(&mut self, component: &Component, sent_before: u64, total: u64) -> DfuResult<u64> {
        let kind = component.kind;
        let image = self.package.read_image(component)?;

        info!(
            component = %kind,
            image_type = kind.image_type(),
            init_packet = image.init_packet.len(),
            firmware = image.firmware.len(),
            "sending image"
        );

        let result = self.transfer(kind, &image, sent_before, total);
        self.transport.close();
        result?;

        self.emit(DfuEvent::ComponentComplete { component: kind });
        Ok(image.firmware.len() as u64)
    }

    fn transfer(
        &mut self,
        kind: ComponentKind,
        image: &FirmwareImage,
        sent_before: u64,
        total: u64,
    ) -> DfuResult<()> {
        self.emit(DfuEvent::Connecting { component: kind });
        self.transport
            .open()
            .map_err(component_failed(kind, TransferStage::Open))?;

        self.emit(DfuEvent::SendingInit { component: kind });
        self.transport
            .send_init_packet(&image.init_packet)
            .map_err(component_failed(kind, TransferStage::InitPacket))?;

        let events = self.events.clone();
        self.transport.register_progress_callback(Box::new(move |sent| {
            let _ = events.send(DfuEvent::Uploading {
                component: kind,
                sent: sent_before + sent as u64,
                total,
            });
        }));

        self.transport
            .send_firmware(&image.firmware)
            .map_err(component_failed(kind, TransferStage::Firmware))
    }

    fn emit(&self, event: DfuEvent) {
        // Nobody listening is not an error
        let _ = self.events.send(event);
    }
}
