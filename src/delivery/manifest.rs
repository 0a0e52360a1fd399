//! Operation summary broadcast after every file frame.

use crate::firmware::{FileOp, FileOperationSet};
use serde::{Deserialize, Serialize};

/// Counts of pending file operations, serialized as
/// `{"delete":d,"update":u,"new":n}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub delete: usize,
    pub update: usize,
    pub new: usize,
}

impl Manifest {
    pub fn from_operations(operations: &FileOperationSet) -> Self {
        Self {
            delete: operations.count(FileOp::Delete),
            update: operations.count(FileOp::Update),
            new: operations.count(FileOp::Create),
        }
    }

    pub fn to_json(&self) -> String {
        // Three integer fields cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"delete":{},"update":{},"new":{}}}"#,
                self.delete, self.update, self.new
            )
        })
    }
}
