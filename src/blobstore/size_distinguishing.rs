use std::sync::Arc;

use crate::blobstore::{BlobAccess, BlobReader};
use crate::digest::Digest;
use crate::error::{Error, Result};

/// routes blobs to one of two stores by declared size
///
/// blobs of at most `cutoff_size_bytes` go to `small`, everything else to
/// `large`. find_missing queries both sides concurrently, and a failure on
/// the small side is returned without waiting for the large side.
pub struct SizeDistinguishingBlobAccess {
    small: Arc<dyn BlobAccess>,
    large: Arc<dyn BlobAccess>,
    cutoff_size_bytes: i64,
}

impl SizeDistinguishingBlobAccess {
    pub fn new(small: Arc<dyn BlobAccess>, large: Arc<dyn BlobAccess>, cutoff_size_bytes: i64) -> Self {
        Self {
            small,
            large,
            cutoff_size_bytes,
        }
    }

    fn route(&self, digest: &Digest) -> &dyn BlobAccess {
        if digest.size_bytes <= self.cutoff_size_bytes {
            self.small.as_ref()
        } else {
            self.large.as_ref()
        }
    }
}

impl BlobAccess for SizeDistinguishingBlobAccess {
    fn get(&self, instance: &str, digest: &Digest) -> Result<BlobReader> {
        self.route(digest).get(instance, digest)
    }

    fn put(&self, instance: &str, digest: &Digest, reader: BlobReader) -> Result<()> {
        self.route(digest).put(instance, digest, reader)
    }

    fn find_missing(&self, instance: &str, digests: &[Digest]) -> Result<Vec<Digest>> {
        let (small, large): (Vec<Digest>, Vec<Digest>) = digests
            .iter()
            .cloned()
            .partition(|d| d.size_bytes <= self.cutoff_size_bytes);

        if large.is_empty() {
            return self.small.find_missing(instance, &small);
        }
        if small.is_empty() {
            return self.large.find_missing(instance, &large);
        }

        // detached: an error on the small side returns without joining it
        let large_handle = {
            let large_store = self.large.clone();
            let instance = instance.to_string();
            std::thread::spawn(move || large_store.find_missing(&instance, &large))
        };
        let mut missing = self.small.find_missing(instance, &small)?;
        let large_missing = large_handle
            .join()
            .unwrap_or_else(|_| Err(Error::Internal("find_missing panicked".into())))?;
        missing.extend(large_missing);
        Ok(missing)
    }

    fn flush(&self) -> Result<()> {
        self.small.flush()?;
        self.large.flush()
    }
}
