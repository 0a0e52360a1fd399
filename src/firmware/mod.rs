//! Firmware store, tree diffing and patch generation.

pub mod engine;
pub mod patch;
pub mod store;
pub mod tree;

pub use engine::{checksum, compress, decompress, Patch, PatchEngine, PatchKind, UpdatePlan, text_patch};
pub use patch::TextPatch;
pub use store::{FirmwareStore, StoreError};
pub use tree::{diff_trees, DiffOptions, FileKind, FileOp, FileOperationSet};

use std::path::{Path, PathBuf};

/// Patch engine errors. Unreadable inputs are always reported, never
/// treated as empty content.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is classified as text but is not valid UTF-8", .0.display())]
    NotUtf8(PathBuf),
    #[error("{} has a name that is not valid UTF-8", .0.display())]
    NonUtf8Path(PathBuf),
    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),
    #[error("malformed patch text: {0}")]
    Malformed(String),
    #[error("patch hunk #{hunk} does not match the source text")]
    HunkMismatch { hunk: usize },
    #[error("generated patch for {0} does not reproduce the new content")]
    Verification(String),
}

impl PatchError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
