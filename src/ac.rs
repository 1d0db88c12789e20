//! action cache: action digest -> previously computed result

use std::sync::Arc;

use crate::blobstore::{get_message, put_bytes, BlobAccess};
use crate::digest::{encode_message, Digest};
use crate::error::Result;
use crate::types::ActionResult;

pub trait ActionCache: Send + Sync {
    /// a miss is reported as a not-found error
    fn get_action_result(&self, instance: &str, action_digest: &Digest) -> Result<ActionResult>;

    fn put_action_result(
        &self,
        instance: &str,
        action_digest: &Digest,
        result: &ActionResult,
    ) -> Result<()>;
}

/// action cache stored in a blob store, one entry per action digest
///
/// entries are keyed by the action digest, not by their own content, so the
/// backing store must not be wrapped in content validation.
pub struct BlobAccessActionCache {
    blob_access: Arc<dyn BlobAccess>,
}

impl BlobAccessActionCache {
    pub fn new(blob_access: Arc<dyn BlobAccess>) -> Self {
        Self { blob_access }
    }
}

impl ActionCache for BlobAccessActionCache {
    fn get_action_result(&self, instance: &str, action_digest: &Digest) -> Result<ActionResult> {
        get_message(self.blob_access.as_ref(), instance, action_digest)
    }

    fn put_action_result(
        &self,
        instance: &str,
        action_digest: &Digest,
        result: &ActionResult,
    ) -> Result<()> {
        let data = encode_message(result)?;
        put_bytes(self.blob_access.as_ref(), instance, action_digest, data)?;
        self.blob_access.flush()
    }
}
