use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::blobstore::{BlobAccess, BlobReader};
use crate::digest::{Digest, DigestKeyer};
use crate::error::{Error, IoResultExt, Result};
use crate::fs::write_atomic;
use crate::hash::Hash;

/// blob store on the local filesystem
///
/// layout:
///
/// ```text
/// <root>/
///   objects/xx/yyyy...   one file per key, named by the SHA-256 of the key
///   tmp/                 staging area for atomic writes
/// ```
///
/// blobs are written to `tmp/` and renamed into place after an fsync, so a
/// failed or short upload never produces a visible object.
pub struct DiskBlobAccess {
    root: PathBuf,
    keyer: DigestKeyer,
}

impl DiskBlobAccess {
    /// open a store, creating its directories and discarding stale uploads
    pub fn open(root: impl AsRef<Path>, keyer: DigestKeyer) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let objects = root.join("objects");
        fs::create_dir_all(&objects).with_path(&objects)?;
        let tmp = root.join("tmp");
        crate::fs::clear_directory(&tmp)?;
        tracing::debug!(path = %root.display(), "opened disk blob store");
        Ok(Self { root, keyer })
    }

    fn object_path(&self, instance: &str, digest: &Digest) -> Result<(String, PathBuf)> {
        let key = self.keyer.key(instance, digest)?;
        let (dir, file) = Hash::of(key.as_bytes()).to_path_components();
        let path = self.root.join("objects").join(dir).join(file);
        Ok((key, path))
    }
}

impl BlobAccess for DiskBlobAccess {
    fn get(&self, instance: &str, digest: &Digest) -> Result<BlobReader> {
        let (key, path) = self.object_path(instance, digest)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::BlobNotFound(key)),
            Err(e) => Err(Error::Io { path, source: e }),
        }
    }

    fn put(&self, instance: &str, digest: &Digest, mut reader: BlobReader) -> Result<()> {
        let (_, path) = self.object_path(instance, digest)?;

        // existing object: still consume the stream so a bad upload is reported
        if path.exists() {
            io::copy(&mut reader, &mut io::sink()).map_err(Error::from_stream)?;
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        write_atomic(&self.root.join("tmp"), &path, &mut reader, 0o644)?;
        Ok(())
    }

    fn find_missing(&self, instance: &str, digests: &[Digest]) -> Result<Vec<Digest>> {
        let mut missing = Vec::new();
        for digest in digests {
            let (_, path) = self.object_path(instance, digest)?;
            if !path.exists() {
                missing.push(digest.clone());
            }
        }
        Ok(missing)
    }
}
