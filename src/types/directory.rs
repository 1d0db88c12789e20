use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{Error, Result};

/// a node of the input or output Merkle tree
///
/// the digest of a serialized directory is its identity, so identical
/// subtrees share storage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    #[serde(default)]
    pub files: Vec<FileNode>,
    #[serde(default)]
    pub directories: Vec<DirectoryNode>,
}

impl Directory {
    /// check every entry name before the directory is materialized
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let names = self
            .files
            .iter()
            .map(|f| &f.name)
            .chain(self.directories.iter().map(|d| &d.name));
        for name in names {
            validate_entry_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(Error::InvalidPath(format!(
                    "duplicate directory entry name: {}",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }
}

/// a regular file inside a directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    #[serde(default)]
    pub is_executable: bool,
}

/// a child directory, referenced by the digest of its serialized form
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub digest: Digest,
}

/// a root directory plus every descendant, stored as one object
///
/// children are deduplicated by digest: a subtree that occurs several times
/// is listed once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub root: Directory,
    #[serde(default)]
    pub children: Vec<Directory>,
}

/// validate a single path component of a directory entry
pub fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidPath("empty entry name".to_string()));
    }
    if name.contains('/') {
        return Err(Error::InvalidPath(format!("name contains '/': {}", name)));
    }
    if name.contains('\0') {
        return Err(Error::InvalidPath(format!(
            "name contains null byte: {}",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidPath(format!("reserved name: {}", name)));
    }
    Ok(())
}
