use std::io::Write;
use std::path::{Path, PathBuf};

use zip::write::FileOptions;
use zip::ZipWriter;

use crate::dfu::manifest::{ComponentKind, MANIFEST_FILENAME};

/// Deterministic firmware bytes of the given length.
pub fn firmware_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

/// Builder for DFU package archives used in tests.
pub struct PackageBuilder {
    components: Vec<(ComponentKind, Vec<u8>, Vec<u8>)>,
    manifest: Option<String>,
    omitted: Vec<String>,
    extra: Vec<(String, Vec<u8>)>,
}

impl PackageBuilder {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            manifest: None,
            omitted: Vec::new(),
            extra: Vec::new(),
        }
    }

    /// Add a component stored as `<manifest key>.bin` / `<manifest key>.dat`.
    pub fn component(mut self, kind: ComponentKind, init_packet: &[u8], firmware: &[u8]) -> Self {
        self.components
            .push((kind, init_packet.to_vec(), firmware.to_vec()));
        self
    }

    pub fn application(self, init_packet: &[u8], firmware: &[u8]) -> Self {
        self.component(ComponentKind::Application, init_packet, firmware)
    }

    pub fn bootloader(self, init_packet: &[u8], firmware: &[u8]) -> Self {
        self.component(ComponentKind::Bootloader, init_packet, firmware)
    }

    /// Use this manifest.json text instead of the generated one.
    pub fn manifest(mut self, json: &str) -> Self {
        self.manifest = Some(json.to_string());
        self
    }

    /// Leave an entry out of the archive.
    pub fn omit(mut self, name: &str) -> Self {
        self.omitted.push(name.to_string());
        self
    }

    /// Add an arbitrary archive entry.
    pub fn entry(mut self, name: &str, content: &[u8]) -> Self {
        self.extra.push((name.to_string(), content.to_vec()));
        self
    }

    /// The manifest.json generated for the added components.
    pub fn manifest_json(&self) -> String {
        let entries: Vec<String> = self
            .components
            .iter()
            .map(|(kind, _, _)| {
                format!(
                    r#""{key}": {{
                "bin_file": "{key}.bin",
                "dat_file": "{key}.dat",
                "init_packet_data": {{"device_type": 82, "softdevice_req": [182]}}
            }}"#,
                    key = kind.manifest_key()
                )
            })
            .collect();

        format!(
            "{{\n    \"manifest\": {{\n        {},\n        \"dfu_version\": 0.5\n    }}\n}}",
            entries.join(",\n        ")
        )
    }

    /// Write the archive to `path`.
    pub fn write_zip(self, path: &Path) -> PathBuf {
        let file = std::fs::File::create(path).expect("Failed to create archive");
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        let mut files = vec![(
            MANIFEST_FILENAME.to_string(),
            self.manifest
                .clone()
                .unwrap_or_else(|| self.manifest_json())
                .into_bytes(),
        )];
        for (kind, init_packet, firmware) in &self.components {
            files.push((format!("{}.dat", kind.manifest_key()), init_packet.clone()));
            files.push((format!("{}.bin", kind.manifest_key()), firmware.clone()));
        }
        files.extend(self.extra.iter().cloned());

        for (name, content) in files {
            if self.omitted.contains(&name) {
                continue;
            }
            zip.start_file(name, options).expect("Failed to start entry");
            zip.write_all(&content).expect("Failed to write entry");
        }

        zip.finish().expect("Failed to finish archive");
        path.to_path_buf()
    }
}

impl Default for PackageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
