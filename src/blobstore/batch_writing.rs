use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::blobstore::{BlobAccess, BlobReader};
use crate::digest::{Digest, DigestKeyer};
use crate::error::{Error, Result};

/// write-behind buffer that uploads only what the base store is missing
///
/// puts are queued with their streams until `flush` (or the batch reaching
/// `threshold` entries). flushing asks the base store which digests it lacks
/// and uploads just those; the remaining streams are dropped unread. queued
/// blobs are not visible through `get` until flushed.
///
/// a batch is bound to one instance, since find_missing is per instance.
pub struct BatchWritingBlobAccess {
    base: Arc<dyn BlobAccess>,
    threshold: usize,
    batch: Mutex<PendingBatch>,
}

#[derive(Default)]
struct PendingBatch {
    instance: Option<String>,
    blobs: HashMap<String, PendingBlob>,
}

struct PendingBlob {
    digest: Digest,
    reader: BlobReader,
}

impl BatchWritingBlobAccess {
    pub fn new(base: Arc<dyn BlobAccess>, threshold: usize) -> Self {
        Self {
            base,
            threshold,
            batch: Mutex::new(PendingBatch::default()),
        }
    }

    /// number of blobs waiting for the next flush
    pub fn pending(&self) -> usize {
        self.batch.lock().blobs.len()
    }

    fn flush_batch(&self, batch: &mut PendingBatch) -> Result<()> {
        // the batch is emptied up front: whatever happens below, every
        // queued stream is released when `blobs` goes out of scope
        let instance = batch.instance.take().unwrap_or_default();
        let mut blobs = std::mem::take(&mut batch.blobs);
        if blobs.is_empty() {
            return Ok(());
        }

        let digests: Vec<Digest> = blobs.values().map(|b| b.digest.clone()).collect();
        let missing = self.base.find_missing(&instance, &digests)?;
        tracing::debug!(
            instance = %instance,
            queued = digests.len(),
            missing = missing.len(),
            "flushing write batch"
        );

        for digest in missing {
            let key = DigestKeyer::WithoutInstance.key(&instance, &digest)?;
            let blob = blobs.remove(&key).ok_or_else(|| {
                Error::Internal(format!(
                    "find_missing returned digest {} that was not requested",
                    digest
                ))
            })?;
            self.base.put(&instance, &blob.digest, blob.reader)?;
        }
        Ok(())
    }
}

impl BlobAccess for BatchWritingBlobAccess {
    fn get(&self, instance: &str, digest: &Digest) -> Result<BlobReader> {
        self.base.get(instance, digest)
    }

    fn put(&self, instance: &str, digest: &Digest, reader: BlobReader) -> Result<()> {
        let key = DigestKeyer::WithoutInstance.key(instance, digest)?;
        let mut batch = self.batch.lock();

        if batch.blobs.len() >= self.threshold {
            self.flush_batch(&mut batch)?;
        }

        match &batch.instance {
            Some(current) if current != instance => {
                return Err(Error::InvalidArgument(format!(
                    "attempted to mix blobs of instances {:?} and {:?} in one write batch",
                    current, instance
                )));
            }
            Some(_) => {}
            None => batch.instance = Some(instance.to_string()),
        }

        batch
            .blobs
            .entry(key)
            .or_insert_with(|| PendingBlob {
                digest: digest.clone(),
                reader,
            });
        Ok(())
    }

    fn find_missing(&self, instance: &str, digests: &[Digest]) -> Result<Vec<Digest>> {
        self.base.find_missing(instance, digests)
    }

    fn flush(&self) -> Result<()> {
        let mut batch = self.batch.lock();
        self.flush_batch(&mut batch)?;
        drop(batch);
        self.base.flush()
    }
}
