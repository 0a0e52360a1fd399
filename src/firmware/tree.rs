//! File-level comparison of two firmware trees.

use super::PatchError;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOp {
    Delete,
    Create,
    Update,
}

/// Relative paths (always `/`-separated) grouped by operation and kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOperationSet {
    pub delete_text: BTreeSet<String>,
    pub delete_binary: BTreeSet<String>,
    pub create_text: BTreeSet<String>,
    pub create_binary: BTreeSet<String>,
    pub update_text: BTreeSet<String>,
    pub update_binary: BTreeSet<String>,
}

impl FileOperationSet {
    pub fn paths(&self, op: FileOp, kind: FileKind) -> &BTreeSet<String> {
        match (op, kind) {
            (FileOp::Delete, FileKind::Text) => &self.delete_text,
            (FileOp::Delete, FileKind::Binary) => &self.delete_binary,
            (FileOp::Create, FileKind::Text) => &self.create_text,
            (FileOp::Create, FileKind::Binary) => &self.create_binary,
            (FileOp::Update, FileKind::Text) => &self.update_text,
            (FileOp::Update, FileKind::Binary) => &self.update_binary,
        }
    }

    fn paths_mut(&mut self, op: FileOp, kind: FileKind) -> &mut BTreeSet<String> {
        match (op, kind) {
            (FileOp::Delete, FileKind::Text) => &mut self.delete_text,
            (FileOp::Delete, FileKind::Binary) => &mut self.delete_binary,
            (FileOp::Create, FileKind::Text) => &mut self.create_text,
            (FileOp::Create, FileKind::Binary) => &mut self.create_binary,
            (FileOp::Update, FileKind::Text) => &mut self.update_text,
            (FileOp::Update, FileKind::Binary) => &mut self.update_binary,
        }
    }

    /// Number of paths under `op`, both kinds.
    pub fn count(&self, op: FileOp) -> usize {
        self.paths(op, FileKind::Text).len() + self.paths(op, FileKind::Binary).len()
    }

    pub fn is_empty(&self) -> bool {
        [FileOp::Delete, FileOp::Create, FileOp::Update]
            .iter()
            .all(|op| self.count(*op) == 0)
    }

    /// Every path to delete, text first.
    pub fn deletions(&self) -> impl Iterator<Item = &String> {
        self.delete_text.iter().chain(self.delete_binary.iter())
    }
}

/// Filters applied while walking and classifying trees.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    pub ignore: HashSet<String>,
    pub binary_extensions: HashSet<String>,
}

impl DiffOptions {
    pub fn new<I, B>(ignore: I, binary_extensions: B) -> Self
    where
        I: IntoIterator<Item = String>,
        B: IntoIterator<Item = String>,
    {
        Self {
            ignore: ignore.into_iter().collect(),
            binary_extensions: binary_extensions
                .into_iter()
                .map(|e| normalize_extension(&e))
                .collect(),
        }
    }

    pub fn classify(&self, path: &str) -> FileKind {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(normalize_extension);
        match ext {
            Some(ext) if self.binary_extensions.contains(&ext) => FileKind::Binary,
            _ => FileKind::Text,
        }
    }
}

fn normalize_extension(ext: &str) -> String {
    format!(".{}", ext.trim_start_matches('.').to_ascii_lowercase())
}

/// Relative file paths under `root`, ignored names excluded.
///
/// `None` stands for an empty tree (first install). Symlinked files are
/// listed; symlinked directories are never descended into.
pub fn list_files(root: Option<&Path>, options: &DiffOptions) -> Result<BTreeSet<String>, PatchError> {
    let mut out = BTreeSet::new();
    let Some(root) = root else {
        return Ok(out);
    };

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            PatchError::io(&path, e.into())
        })?;
        let is_file = if entry.path_is_symlink() {
            entry.path().is_file()
        } else {
            entry.file_type().is_file()
        };
        if !is_file {
            continue;
        }
        let name = entry
            .file_name()
            .to_str()
            .ok_or_else(|| PatchError::NonUtf8Path(entry.path().to_path_buf()))?;
        if options.ignore.contains(name) {
            continue;
        }
        out.insert(relative_path(root, entry.path())?);
    }
    Ok(out)
}

/// `/`-separated path of `path` below `root`.
fn relative_path(root: &Path, path: &Path) -> Result<String, PatchError> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| PatchError::NonUtf8Path(path.to_path_buf()))?;
    Ok(parts.join("/"))
}

/// Partition every path that differs between `left` and `right`.
pub fn diff_trees(
    left: Option<&Path>,
    right: &Path,
    options: &DiffOptions,
) -> Result<FileOperationSet, PatchError> {
    let left_paths = list_files(left, options)?;
    let right_paths = list_files(Some(right), options)?;
    let mut ops = FileOperationSet::default();

    for path in left_paths.difference(&right_paths) {
        ops.paths_mut(FileOp::Delete, options.classify(path))
            .insert(path.clone());
    }
    for path in right_paths.difference(&left_paths) {
        ops.paths_mut(FileOp::Create, options.classify(path))
            .insert(path.clone());
    }
    if let Some(left) = left {
        for path in left_paths.intersection(&right_paths) {
            if !same_content(&left.join(path), &right.join(path))? {
                ops.paths_mut(FileOp::Update, options.classify(path))
                    .insert(path.clone());
            }
        }
    }
    Ok(ops)
}

fn same_content(a: &Path, b: &Path) -> Result<bool, PatchError> {
    let meta_a = fs::metadata(a).map_err(|e| PatchError::io(a, e))?;
    let meta_b = fs::metadata(b).map_err(|e| PatchError::io(b, e))?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    let bytes_a = fs::read(a).map_err(|e| PatchError::io(a, e))?;
    let bytes_b = fs::read(b).map_err(|e| PatchError::io(b, e))?;
    Ok(bytes_a == bytes_b)
}
