//! Versioned firmware store: one directory per release under a common root.

use crate::protocol::FirmwareVersion;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot list firmware store {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("firmware store {} contains no version directories", .0.display())]
    Empty(PathBuf),
    #[error("firmware store {} has no directory for version {version}", path.display())]
    MissingVersion { path: PathBuf, version: String },
}

/// Read-only view over the firmware store root.
#[derive(Debug, Clone)]
pub struct FirmwareStore {
    root: PathBuf,
}

impl FirmwareStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All version directories, sorted ascending.
    ///
    /// Plain files and directories whose name is not a version are skipped.
    pub fn versions(&self) -> Result<Vec<FirmwareVersion>, StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.root.clone(),
            source,
        };
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.file_type().map_err(io_err)?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().map(str::parse::<FirmwareVersion>) {
                Some(Ok(version)) => versions.push(version),
                _ => debug!(entry = ?name, "Skipping non-version directory in firmware store"),
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Highest version present.
    pub fn latest(&self) -> Result<FirmwareVersion, StoreError> {
        self.versions()?
            .pop()
            .ok_or_else(|| StoreError::Empty(self.root.clone()))
    }

    /// Directory holding `version`, if the store has it.
    ///
    /// Devices may report a version string spelled differently from the
    /// directory (`1.01` vs `1.1`), so lookup goes through the parsed form.
    pub fn tree(&self, version: &FirmwareVersion) -> Result<Option<PathBuf>, StoreError> {
        let exact = self.root.join(version.as_str());
        if exact.is_dir() {
            return Ok(Some(exact));
        }
        Ok(self
            .versions()?
            .into_iter()
            .find(|v| v == version)
            .map(|v| self.root.join(v.as_str())))
    }
}
