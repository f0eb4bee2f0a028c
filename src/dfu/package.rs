//! DFU package loader.
//!
//! A package is a zip archive holding `manifest.json` plus a `.bin` image and
//! a `.dat` init packet per component. It is unpacked into a fresh directory
//! and the images are read from there at transfer time.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::error::{DfuError, DfuResult, PackageError, PackageResult};
use super::manifest::{Component, ComponentKind, Manifest, MANIFEST_FILENAME};

/// Init packet and firmware bytes of one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub init_packet: Vec<u8>,
    pub firmware: Vec<u8>,
}

/// An unpacked, validated DFU package.
#[derive(Debug, Clone)]
pub struct Package {
    manifest: Manifest,
    directory: PathBuf,
}

/// Unpack `archive_path` into `target_directory` and parse its manifest.
///
/// `target_directory` must not exist yet; its parent must. Nothing is written
/// when any precondition fails. A failure after extraction leaves the
/// extracted files in place.
pub fn unpack_and_parse(
    archive_path: impl AsRef<Path>,
    target_directory: impl AsRef<Path>,
) -> PackageResult<Package> {
    let archive_path = archive_path.as_ref();
    let target = absolute(target_directory.as_ref())?;

    if !archive_path.is_file() {
        return Err(PackageError::NotFound {
            path: archive_path.to_path_buf(),
        });
    }

    let parent = target
        .parent()
        .ok_or_else(|| PackageError::InvalidDestination {
            path: target.clone(),
            reason: "has no parent directory".to_string(),
        })?;
    if !parent.is_dir() {
        return Err(PackageError::InvalidDestination {
            path: target.clone(),
            reason: format!("parent {} is not an existing directory", parent.display()),
        });
    }

    if target.exists() {
        return Err(PackageError::DestinationExists { path: target });
    }

    let mut archive = zip::ZipArchive::new(File::open(archive_path)?)?;
    info!(
        archive = %archive_path.display(),
        target = %target.display(),
        entries = archive.len(),
        "unpacking DFU package"
    );
    archive.extract(&target)?;

    Package::from_directory(target)
}

fn absolute(path: &Path) -> PackageResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

impl Package {
    /// Load a package that is already unpacked in `directory`.
    pub fn from_directory(directory: impl Into<PathBuf>) -> PackageResult<Self> {
        let directory = directory.into();
        let manifest_path = directory.join(MANIFEST_FILENAME);

        if !manifest_path.is_file() {
            return Err(PackageError::invalid_manifest(format!(
                "{} missing from package",
                MANIFEST_FILENAME
            )));
        }

        let manifest = Manifest::from_json(&std::fs::read_to_string(&manifest_path)?)?;

        for component in manifest.components() {
            for file in [&component.bin_file, &component.dat_file] {
                if !directory.join(file).is_file() {
                    return Err(PackageError::invalid_manifest(format!(
                        "{} file {} missing from package",
                        component.kind,
                        file.display()
                    )));
                }
            }
            debug!(component = %component.kind, bin = %component.bin_file.display(), "component found");
        }

        Ok(Self {
            manifest,
            directory,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Directory the package was unpacked into.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn bin_path(&self, component: &Component) -> PathBuf {
        self.directory.join(&component.bin_file)
    }

    pub fn dat_path(&self, component: &Component) -> PathBuf {
        self.directory.join(&component.dat_file)
    }

    /// Size in bytes of a component's firmware image, from file metadata.
    pub fn binary_size(&self, component: &Component) -> DfuResult<u64> {
        let path = self.bin_path(component);
        std::fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|source| DfuError::ImageRead {
                component: component.kind,
                path,
                source,
            })
    }

    /// Read a component's init packet and firmware image.
    pub fn read_image(&self, component: &Component) -> DfuResult<FirmwareImage> {
        let read = |path: PathBuf| {
            std::fs::read(&path).map_err(|source| DfuError::ImageRead {
                component: component.kind,
                path,
                source,
            })
        };

        Ok(FirmwareImage {
            init_packet: read(self.dat_path(component))?,
            firmware: read(self.bin_path(component))?,
        })
    }

    /// The component of a given kind, if the package has one.
    pub fn component(&self, kind: ComponentKind) -> Option<&Component> {
        self.manifest.get(kind)
    }
}
