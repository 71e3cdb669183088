use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a path changed relative to the last completed backup of its root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Updated,
    Unchanged,
    Deleted,
}

/// Lifecycle of a journal task within one backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Unstarted,
    InProgress,
    Finished,
}

/// Location of a payload inside a stored object.
///
/// For packed chunks `offset`/`len` address the decrypted chunk plaintext.
/// For per-file objects the extent spans the whole object (`offset == 0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChunkExtent {
    pub chunk_name: String,
    pub offset: u64,
    pub len: u64,
}

/// The persisted outcome of one journal task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CloudRelPath {
    pub rel_path: String,
    #[serde(default)]
    pub chunk_extents: Vec<ChunkExtent>,
    /// Tombstone marker: the path was removed from the source tree
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_deleted: bool,
}

impl CloudRelPath {
    pub fn new(rel_path: impl Into<String>, chunk_extents: Vec<ChunkExtent>) -> Self {
        Self {
            rel_path: rel_path.into(),
            chunk_extents,
            is_deleted: false,
        }
    }

    pub fn tombstone(rel_path: impl Into<String>) -> Self {
        Self {
            rel_path: rel_path.into(),
            chunk_extents: Vec::new(),
            is_deleted: true,
        }
    }
}

/// Metadata record serialized in front of every entry payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub is_dir: bool,
    /// Modification time, Unix seconds
    pub mod_time: i64,
    /// Content length in bytes (0 for directories)
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, Vec<u8>>,
}
