use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::cas::ContentAddressableStorage;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::types::{Directory, DirectoryNode, FileNode, Tree};

/// upload every file below `root` and describe the directory as a [`Tree`]
///
/// children are deduplicated by digest, so identical subdirectories appear
/// once. entries are visited in name order, which makes the resulting tree
/// (and its digest) independent of directory iteration order. entries other
/// than regular files and directories are skipped.
pub fn build_tree(cas: &dyn ContentAddressableStorage, instance: &str, root: &Path) -> Result<Tree> {
    let mut pending: HashMap<PathBuf, Directory> = HashMap::new();
    let mut children: BTreeMap<Digest, Directory> = BTreeMap::new();
    let mut root_directory = None;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .contents_first(true)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| Error::Io {
            path: root.to_path_buf(),
            source: e.into(),
        })?;
        let path = entry.path();
        let file_type = entry.file_type();

        if entry.depth() == 0 {
            if !file_type.is_dir() {
                return Err(Error::InvalidPath(format!(
                    "{} is not a directory",
                    path.display()
                )));
            }
            root_directory = Some(pending.remove(path).unwrap_or_default());
            continue;
        }

        let name = entry.file_name().to_str().ok_or_else(|| {
            Error::InvalidPath(format!("{} is not valid UTF-8", path.display()))
        })?;
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?
            .to_path_buf();

        if file_type.is_file() {
            let (digest, is_executable) = cas.put_file(instance, path)?;
            pending.entry(parent).or_default().files.push(FileNode {
                name: name.to_string(),
                digest,
                is_executable,
            });
        } else if file_type.is_dir() {
            let directory = pending.remove(path).unwrap_or_default();
            let digest = Digest::of_message(&directory)?;
            pending.entry(parent).or_default().directories.push(DirectoryNode {
                name: name.to_string(),
                digest: digest.clone(),
            });
            children.entry(digest).or_insert(directory);
        } else {
            tracing::warn!(path = %path.display(), "skipping output entry that is neither file nor directory");
        }
    }

    let root = root_directory
        .ok_or_else(|| Error::InvalidPath(format!("{} not found", root.display())))?;
    Ok(Tree {
        root,
        children: children.into_values().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::{read_blob, MemoryBlobAccess};
    use crate::cas::BlobAccessContentAddressableStorage;
    use crate::digest::DigestKeyer;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn setup() -> (Arc<MemoryBlobAccess>, BlobAccessContentAddressableStorage) {
        let blobs = Arc::new(MemoryBlobAccess::new(DigestKeyer::WithoutInstance));
        let cas = BlobAccessContentAddressableStorage::new(blobs.clone());
        (blobs, cas)
    }

    #[test]
    fn test_build_tree_uploads_files() {
        let dir = tempdir().unwrap();
        let (blobs, cas) = setup();

        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.txt"), b"bee").unwrap();
        fs::write(dir.path().join("a.txt"), b"ay").unwrap();
        fs::write(dir.path().join("sub/c.txt"), b"sea").unwrap();

        let tree = build_tree(&cas, "", dir.path()).unwrap();

        let names: Vec<&str> = tree.root.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(tree.root.directories.len(), 1);
        assert_eq!(tree.root.directories[0].name, "sub");
        assert_eq!(tree.children.len(), 1);
        assert_eq!(
            tree.root.directories[0].digest,
            Digest::of_message(&tree.children[0]).unwrap()
        );

        let sub_file = &tree.children[0].files[0];
        assert_eq!(read_blob(blobs.as_ref(), "", &sub_file.digest).unwrap(), b"sea");
    }

    #[test]
    fn test_identical_subtrees_are_stored_once() {
        let dir = tempdir().unwrap();
        let (_blobs, cas) = setup();

        for name in ["x", "y"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
            fs::write(dir.path().join(name).join("same"), b"content").unwrap();
        }

        let tree = build_tree(&cas, "", dir.path()).unwrap();
        assert_eq!(tree.root.directories.len(), 2);
        assert_eq!(
            tree.root.directories[0].digest,
            tree.root.directories[1].digest
        );
        assert_eq!(tree.children.len(), 1);
    }

    #[test]
    fn test_empty_directory() {
        let dir = tempdir().unwrap();
        let (_blobs, cas) = setup();

        let tree = build_tree(&cas, "", dir.path()).unwrap();
        assert!(tree.root.is_empty());
        assert!(tree.children.is_empty());
    }

    #[test]
    fn test_root_must_be_directory() {
        let dir = tempdir().unwrap();
        let (_blobs, cas) = setup();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();

        assert!(matches!(
            build_tree(&cas, "", &file),
            Err(Error::InvalidPath(_))
        ));
    }
}
