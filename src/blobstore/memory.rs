use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::blobstore::{drain, BlobAccess, BlobReader};
use crate::digest::{Digest, DigestKeyer};
use crate::error::{Error, Result};

/// in-memory blob store
///
/// a blob is inserted only after its put stream has been read to the end
/// without error.
pub struct MemoryBlobAccess {
    keyer: DigestKeyer,
    blobs: RwLock<HashMap<String, Arc<[u8]>>>,
}

impl MemoryBlobAccess {
    pub fn new(keyer: DigestKeyer) -> Self {
        Self {
            keyer,
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobAccess for MemoryBlobAccess {
    fn get(&self, instance: &str, digest: &Digest) -> Result<BlobReader> {
        let key = self.keyer.key(instance, digest)?;
        let blob = self
            .blobs
            .read()
            .get(&key)
            .cloned()
            .ok_or(Error::BlobNotFound(key))?;
        Ok(Box::new(Cursor::new(blob)))
    }

    fn put(&self, instance: &str, digest: &Digest, mut reader: BlobReader) -> Result<()> {
        let key = self.keyer.key(instance, digest)?;
        let data = drain(&mut reader)?;
        self.blobs.write().insert(key, data.into());
        Ok(())
    }

    fn find_missing(&self, instance: &str, digests: &[Digest]) -> Result<Vec<Digest>> {
        let blobs = self.blobs.read();
        let mut missing = Vec::new();
        for digest in digests {
            if !blobs.contains_key(&self.keyer.key(instance, digest)?) {
                missing.push(digest.clone());
            }
        }
        Ok(missing)
    }
}
