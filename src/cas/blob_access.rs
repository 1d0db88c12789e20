use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::blobstore::{get_message, put_message, BlobAccess};
use crate::cas::{file_mode, ContentAddressableStorage};
use crate::digest::Digest;
use crate::error::{IoResultExt, Result};
use crate::fs::{is_executable, write_new_file};
use crate::hash::Hasher;
use crate::types::{Command, Directory, Tree};

/// CAS over a blob store
pub struct BlobAccessContentAddressableStorage {
    blob_access: Arc<dyn BlobAccess>,
}

impl BlobAccessContentAddressableStorage {
    pub fn new(blob_access: Arc<dyn BlobAccess>) -> Self {
        Self { blob_access }
    }
}

impl ContentAddressableStorage for BlobAccessContentAddressableStorage {
    fn get_command(&self, instance: &str, digest: &Digest) -> Result<Command> {
        get_message(self.blob_access.as_ref(), instance, digest)
    }

    fn get_directory(&self, instance: &str, digest: &Digest) -> Result<Directory> {
        get_message(self.blob_access.as_ref(), instance, digest)
    }

    fn get_file(
        &self,
        instance: &str,
        digest: &Digest,
        path: &Path,
        is_executable: bool,
    ) -> Result<()> {
        let mut reader = self.blob_access.get(instance, digest)?;
        write_new_file(path, &mut reader, file_mode(is_executable))?;
        Ok(())
    }

    fn put_file(&self, instance: &str, path: &Path) -> Result<(Digest, bool)> {
        // first pass computes the digest, second pass uploads under it
        let mut file = File::open(path).with_path(path)?;
        let executable = is_executable(&file.metadata().with_path(path)?);
        let mut hasher = Hasher::new();
        io::copy(&mut file, &mut hasher).with_path(path)?;
        let size = hasher.len();
        let digest = Digest::from_parts(hasher.finalize(), size);

        let file = File::open(path).with_path(path)?;
        self.blob_access.put(instance, &digest, Box::new(file))?;
        Ok((digest, executable))
    }

    fn put_tree(&self, instance: &str, tree: &Tree) -> Result<Digest> {
        put_message(self.blob_access.as_ref(), instance, tree)
    }

    fn flush(&self) -> Result<()> {
        self.blob_access.flush()
    }
}
