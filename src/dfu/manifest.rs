//! Typed model of a DFU package's manifest.json.
//!
//! ```json
//! {
//!     "manifest": {
//!         "bootloader": {
//!             "bin_file": "bootloader.bin",
//!             "dat_file": "bootloader.dat",
//!             "init_packet_data": {
//!                 "device_type": 5,
//!                 "softdevice_req": [17, 18]
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! Components that are not part of the package are omitted, as are absent
//! init packet fields.

use std::fmt;
use std::path::{Component as PathComponent, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::{PackageError, PackageResult};

/// Name of the manifest inside a DFU package.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Firmware unit a package can update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// SoftDevice and bootloader in one image (same flash region as both).
    SoftdeviceBootloader,
    Softdevice,
    Bootloader,
    Application,
}

impl ComponentKind {
    /// Order in which components are written to the device.
    ///
    /// The stack and bootloader must be in place before an application that
    /// depends on them can be validated.
    pub const TRANSFER_ORDER: [ComponentKind; 4] = [
        ComponentKind::SoftdeviceBootloader,
        ComponentKind::Softdevice,
        ComponentKind::Bootloader,
        ComponentKind::Application,
    ];

    /// Key of this component in manifest.json.
    pub fn manifest_key(&self) -> &'static str {
        match self {
            ComponentKind::SoftdeviceBootloader => "softdevice_bootloader",
            ComponentKind::Softdevice => "softdevice",
            ComponentKind::Bootloader => "bootloader",
            ComponentKind::Application => "application",
        }
    }

    /// Image type identifier used by Nordic bootloaders for this component.
    pub fn image_type(&self) -> u8 {
        match self {
            ComponentKind::Softdevice => 0x01,
            ComponentKind::Bootloader => 0x02,
            ComponentKind::SoftdeviceBootloader => 0x03,
            ComponentKind::Application => 0x04,
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.manifest_key())
    }
}

/// Metadata describing the image to the bootloader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPacketData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_revision: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_crc16: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_hash: Option<String>,
    /// Accepted SoftDevice firmware IDs, in preference order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub softdevice_req: Vec<u16>,
}

/// One firmware image and its init packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub kind: ComponentKind,
    /// Firmware image, relative to the package root.
    pub bin_file: PathBuf,
    /// Init packet, relative to the package root.
    pub dat_file: PathBuf,
    pub init_packet_data: InitPacketData,
    /// SoftDevice part size of a combined image.
    pub sd_size: Option<u32>,
    /// Bootloader part size of a combined image.
    pub bl_size: Option<u32>,
}

/// Parsed manifest. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub softdevice_bootloader: Option<Component>,
    pub softdevice: Option<Component>,
    pub bootloader: Option<Component>,
    pub application: Option<Component>,
    pub dfu_version: Option<f32>,
}

// Raw manifest.json structure for (de)serialization.
#[derive(Debug, Serialize, Deserialize)]
struct RawManifest {
    manifest: ManifestBody,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    softdevice_bootloader: Option<ComponentEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    softdevice: Option<ComponentEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bootloader: Option<ComponentEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    application: Option<ComponentEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dfu_version: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ComponentEntry {
    bin_file: PathBuf,
    dat_file: PathBuf,
    #[serde(default)]
    init_packet_data: InitPacketData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sd_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bl_size: Option<u32>,
}

impl ComponentEntry {
    fn into_component(self, kind: ComponentKind) -> Component {
        Component {
            kind,
            bin_file: self.bin_file,
            dat_file: self.dat_file,
            init_packet_data: self.init_packet_data,
            sd_size: self.sd_size,
            bl_size: self.bl_size,
        }
    }

    fn from_component(component: &Component) -> Self {
        Self {
            bin_file: component.bin_file.clone(),
            dat_file: component.dat_file.clone(),
            init_packet_data: component.init_packet_data.clone(),
            sd_size: component.sd_size,
            bl_size: component.bl_size,
        }
    }
}

impl Manifest {
    /// Parse and validate manifest.json contents.
    pub fn from_json(json: &str) -> PackageResult<Self> {
        let raw: RawManifest = serde_json::from_str(json)
            .map_err(|e| PackageError::invalid_manifest(e.to_string()))?;
        let body = raw.manifest;

        let manifest = Self {
            softdevice_bootloader: body
                .softdevice_bootloader
                .map(|e| e.into_component(ComponentKind::SoftdeviceBootloader)),
            softdevice: body
                .softdevice
                .map(|e| e.into_component(ComponentKind::Softdevice)),
            bootloader: body
                .bootloader
                .map(|e| e.into_component(ComponentKind::Bootloader)),
            application: body
                .application
                .map(|e| e.into_component(ComponentKind::Application)),
            dfu_version: body.dfu_version,
        };

        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize back to manifest.json form, omitting absent entries.
    pub fn to_json(&self) -> PackageResult<String> {
        let raw = RawManifest {
            manifest: ManifestBody {
                softdevice_bootloader: self
                    .softdevice_bootloader
                    .as_ref()
                    .map(ComponentEntry::from_component),
                softdevice: self.softdevice.as_ref().map(ComponentEntry::from_component),
                bootloader: self.bootloader.as_ref().map(ComponentEntry::from_component),
                application: self.application.as_ref().map(ComponentEntry::from_component),
                dfu_version: self.dfu_version,
            },
        };

        serde_json::to_string_pretty(&raw).map_err(|e| PackageError::invalid_manifest(e.to_string()))
    }

    /// Check the structural invariants of a manifest.
    pub fn validate(&self) -> PackageResult<()> {
        if self.components().is_empty() {
            return Err(PackageError::invalid_manifest(
                "manifest contains no firmware components",
            ));
        }

        if self.softdevice_bootloader.is_some()
            && (self.softdevice.is_some() || self.bootloader.is_some())
        {
            return Err(PackageError::invalid_manifest(
                "softdevice_bootloader cannot be combined with a standalone softdevice or bootloader",
            ));
        }

        for component in self.components() {
            check_relative(component, &component.bin_file)?;
            check_relative(component, &component.dat_file)?;
        }

        Ok(())
    }

    /// The component of a given kind, if present.
    pub fn get(&self, kind: ComponentKind) -> Option<&Component> {
        match kind {
            ComponentKind::SoftdeviceBootloader => self.softdevice_bootloader.as_ref(),
            ComponentKind::Softdevice => self.softdevice.as_ref(),
            ComponentKind::Bootloader => self.bootloader.as_ref(),
            ComponentKind::Application => self.application.as_ref(),
        }
    }

    /// Present components in transfer order.
    pub fn components(&self) -> Vec<&Component> {
        ComponentKind::TRANSFER_ORDER
            .iter()
            .filter_map(|&kind| self.get(kind))
            .collect()
    }
}

/// Referenced files must stay inside the package directory.
fn check_relative(component: &Component, path: &Path) -> PackageResult<()> {
    let escapes = path.as_os_str().is_empty()
        || path
            .components()
            .any(|c| !matches!(c, PathComponent::Normal(_) | PathComponent::CurDir));

    if escapes {
        return Err(PackageError::invalid_manifest(format!(
            "{} references '{}' outside the package",
            component.kind,
            path.display()
        )));
    }
    Ok(())
}
