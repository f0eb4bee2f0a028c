use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use super::fixtures::PackageBuilder;

/// Test context with temporary directory management.
/// Automatically cleans up when dropped.
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a new test context with a fresh temporary directory
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Get the root path of the temporary directory
    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Create a file with content at the given relative path
    pub fn create_file(&self, relative_path: &str, content: &str) -> PathBuf {
        self.create_file_bytes(relative_path, content.as_bytes())
    }

    /// Create a file with binary content at the given relative path
    pub fn create_file_bytes(&self, relative_path: &str, content: &[u8]) -> PathBuf {
        let path = self.root().join(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        fs::write(&path, content).expect("Failed to write file");
        path
    }

    /// Write a package archive at the given relative path
    pub fn create_package(&self, relative_path: &str, builder: PackageBuilder) -> PathBuf {
        builder.write_zip(&self.path(relative_path))
    }

    /// Get full path for a relative path
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    /// Check if a relative path exists
    pub fn exists(&self, relative: &str) -> bool {
        self.path(relative).exists()
    }

    /// Read file content at relative path
    pub fn read_file(&self, relative: &str) -> String {
        fs::read_to_string(self.path(relative)).expect("Failed to read file")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
