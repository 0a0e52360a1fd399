//! Patch Engine — turns two firmware trees into deliverable payloads
//!
//! Text files are shipped as compressed diff-match-patch patches, binary
//! files as compressed full replacements. Each payload carries the hex SHA-1
//! of its uncompressed form so the device can reject corrupted transfers.

use super::patch::TextPatch;
use super::tree::{diff_trees, DiffOptions, FileKind, FileOp, FileOperationSet};
use super::PatchError;
use crate::config::FirmwareConfig;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// How the device must treat a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Compressed patch text applied to the existing file
    TextDiff,
    /// Compressed file content replacing the file outright
    FullReplace,
}

/// One deliverable file payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub kind: PatchKind,
    pub compressed: Vec<u8>,
    /// Hex SHA-1 of the uncompressed payload
    pub checksum: String,
}

/// Everything the delivery phase needs for one version transition.
#[derive(Debug, Clone, Default)]
pub struct UpdatePlan {
    pub operations: FileOperationSet,
    pub patches: BTreeMap<String, Patch>,
}

/// Computes file operations and patches between firmware trees.
#[derive(Debug, Clone, Default)]
pub struct PatchEngine {
    options: DiffOptions,
}

impl PatchEngine {
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &FirmwareConfig) -> Self {
        Self::new(DiffOptions::new(
            config.ignore.iter().cloned(),
            config.binary_extensions.iter().cloned(),
        ))
    }

    /// Diff `left` (None = empty tree) against `right` and build every payload.
    pub fn plan(&self, left: Option<&Path>, right: &Path) -> Result<UpdatePlan, PatchError> {
        let operations = diff_trees(left, right, &self.options)?;
        info!(
            delete = operations.count(FileOp::Delete),
            create = operations.count(FileOp::Create),
            update = operations.count(FileOp::Update),
            "Firmware diff computed"
        );
        let patches = self.build_patches(left, right, &operations)?;
        Ok(UpdatePlan {
            operations,
            patches,
        })
    }

    /// Build payloads for every create/update in `operations`.
    pub fn build_patches(
        &self,
        left: Option<&Path>,
        right: &Path,
        operations: &FileOperationSet,
    ) -> Result<BTreeMap<String, Patch>, PatchError> {
        let mut patches = BTreeMap::new();

        for op in [FileOp::Update, FileOp::Create] {
            for path in operations.paths(op, FileKind::Text) {
                let old = match (op, left) {
                    (FileOp::Update, Some(left)) => read_text(&left.join(path))?,
                    _ => String::new(),
                };
                let new = read_text(&right.join(path))?;
                let patch = text_patch(path, &old, &new)?;
                debug!(path = %path, bytes = patch.compressed.len(), "Text patch built");
                patches.insert(path.clone(), patch);
            }
            for path in operations.paths(op, FileKind::Binary) {
                let source = right.join(path);
                let content = fs::read(&source).map_err(|e| PatchError::io(&source, e))?;
                let patch = Patch {
                    kind: PatchKind::FullReplace,
                    compressed: compress(&content)?,
                    checksum: checksum(&content),
                };
                debug!(path = %path, bytes = patch.compressed.len(), "Binary replacement built");
                patches.insert(path.clone(), patch);
            }
        }
        Ok(patches)
    }
}

/// Build and self-verify the patch for one text file.
pub fn text_patch(path: &str, old: &str, new: &str) -> Result<Patch, PatchError> {
    let text = TextPatch::make(old, new).to_text();
    let reparsed = TextPatch::from_text(&text)?;
    if reparsed.apply(old)? != new {
        return Err(PatchError::Verification(path.to_string()));
    }
    Ok(Patch {
        kind: PatchKind::TextDiff,
        compressed: compress(text.as_bytes())?,
        checksum: checksum(text.as_bytes()),
    })
}

fn read_text(path: &Path) -> Result<String, PatchError> {
    let bytes = fs::read(path).map_err(|e| PatchError::io(path, e))?;
    String::from_utf8(bytes).map_err(|_| PatchError::NotUtf8(path.to_path_buf()))
}

/// Hex-encoded SHA-1 (20 bytes) of `data`.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// zlib-compress `data`.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(PatchError::Compression)?;
    encoder.finish().map_err(PatchError::Compression)
}

/// Inverse of [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(PatchError::Compression)?;
    Ok(out)
}
