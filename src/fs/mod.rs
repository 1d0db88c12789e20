//! filesystem primitives shared by the disk store, the file cache and the
//! local executor

use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// copy a stream into a newly created file
///
/// fails if `path` already exists. on any error the partial file is removed,
/// so the path is either absent or fully written and synced.
pub fn write_new_file(path: &Path, reader: &mut dyn Read, mode: u32) -> Result<u64> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .with_path(path)?;

    let written = copy_and_sync(&mut file, path, reader);
    if written.is_err() {
        drop(file);
        let _ = fs::remove_file(path);
    }
    written
}

/// stream content to `dest` through a temporary file in `tmp_dir`
///
/// the destination only appears once content is synced, so readers never
/// observe a partial file.
pub fn write_atomic(tmp_dir: &Path, dest: &Path, reader: &mut dyn Read, mode: u32) -> Result<u64> {
    let tmp_path = tmp_dir.join(uuid::Uuid::new_v4().to_string());
    let written = write_new_file(&tmp_path, reader, mode)?;

    if let Err(e) = fs::rename(&tmp_path, dest).with_path(dest) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    if let Some(parent) = dest.parent() {
        fsync_dir(parent)?;
    }
    Ok(written)
}

fn copy_and_sync(file: &mut File, path: &Path, reader: &mut dyn Read) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).map_err(Error::from_stream)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).with_path(path)?;
        total += n as u64;
    }
    file.sync_all().with_path(path)?;
    Ok(total)
}

/// sync a directory to disk
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}

/// create a hardlink at `link_path`; an existing entry is an error
pub fn create_hardlink(target_path: &Path, link_path: &Path) -> Result<()> {
    fs::hard_link(target_path, link_path).with_path(link_path)
}

pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, Permissions::from_mode(mode & 0o7777)).with_path(path)
}

/// remove everything below `path`, leaving an empty directory behind
///
/// a finished build may have left directories without write permission, so
/// those are opened up before removal.
pub fn clear_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path).with_path(path)?;
        return Ok(());
    }

    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_dir() {
            set_mode(entry.path(), 0o755)?;
        }
    }

    for entry in fs::read_dir(path).with_path(path)? {
        let entry = entry.with_path(path)?;
        let child = entry.path();
        if entry.file_type().with_path(&child)?.is_dir() {
            fs::remove_dir_all(&child).with_path(&child)?;
        } else {
            fs::remove_file(&child).with_path(&child)?;
        }
    }
    Ok(())
}

/// read a file only if it is at most `limit` bytes
pub fn read_small_file(path: &Path, limit: u64) -> Result<Option<Vec<u8>>> {
    let meta = fs::metadata(path).with_path(path)?;
    if meta.len() > limit {
        return Ok(None);
    }
    Ok(Some(fs::read(path).with_path(path)?))
}

/// true if any execute bit is set
pub fn is_executable(meta: &fs::Metadata) -> bool {
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::os::unix::fs::MetadataExt;
    use tempfile::tempdir;

    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(Error::BlobTooShort(1).into_stream())
        }
    }

    #[test]
    fn test_write_new_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");

        let n = write_new_file(&path, &mut Cursor::new(b"hello"), 0o444).unwrap();
        assert_eq!(n, 5);
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o777, 0o444);

        // exclusive creation
        assert!(write_new_file(&path, &mut Cursor::new(b"again"), 0o444).is_err());
    }

    #[test]
    fn test_write_new_file_removes_partial() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");

        let result = write_new_file(&path, &mut BrokenReader, 0o644);
        assert!(matches!(result, Err(Error::BlobTooShort(1))));
        assert!(!path.exists());
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        fs::create_dir(&tmp).unwrap();
        let dest = dir.path().join("dest");

        write_atomic(&tmp, &dest, &mut Cursor::new(b"content"), 0o644).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"content");
        assert_eq!(fs::read_dir(&tmp).unwrap().count(), 0);

        assert!(write_atomic(&tmp, &dest, &mut BrokenReader, 0o644).is_err());
        assert_eq!(fs::read(&dest).unwrap(), b"content");
        assert_eq!(fs::read_dir(&tmp).unwrap().count(), 0);
    }

    #[test]
    fn test_create_hardlink() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        fs::write(&target, b"shared").unwrap();

        create_hardlink(&target, &link).unwrap();
        assert_eq!(
            fs::metadata(&target).unwrap().ino(),
            fs::metadata(&link).unwrap().ino()
        );
        assert!(create_hardlink(&target, &link).is_err());
    }

    #[test]
    fn test_read_small_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"12345").unwrap();

        assert_eq!(read_small_file(&path, 5).unwrap(), Some(b"12345".to_vec()));
        assert_eq!(read_small_file(&path, 4).unwrap(), None);
    }

    #[test]
    fn test_clear_directory() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("build");
        let locked = root.join("a/b");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("file"), b"x").unwrap();
        fs::write(root.join("top"), b"y").unwrap();
        set_mode(&locked, 0o555).unwrap();

        clear_directory(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);

        let fresh = dir.path().join("fresh");
        clear_directory(&fresh).unwrap();
        assert!(fresh.is_dir());
    }
}
