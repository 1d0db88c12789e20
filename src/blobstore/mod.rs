//! byte-exact blob storage behind one narrow contract
//!
//! backends ([`MemoryBlobAccess`], [`DiskBlobAccess`]) store bytes; decorators
//! ([`MerkleBlobAccess`], [`SizeDistinguishingBlobAccess`],
//! [`BatchWritingBlobAccess`]) wrap any other implementation and are composed
//! by nesting.
//!
//! # Put contract
//!
//! `put` hands ownership of a reader to the store. A store must read it to
//! the end before committing and must commit nothing if any read fails: a
//! validating reader reports a length or checksum mismatch as a read error,
//! and that is how a corrupt upload is kept from ever becoming visible.

mod batch_writing;
mod disk;
mod memory;
mod merkle;
mod size_distinguishing;

use std::io::{Cursor, Read};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::digest::{decode_message, encode_message, Digest};
use crate::error::{Error, Result};

pub use batch_writing::BatchWritingBlobAccess;
pub use disk::DiskBlobAccess;
pub use memory::MemoryBlobAccess;
pub use merkle::{MerkleBlobAccess, ValidatingReader};
pub use size_distinguishing::SizeDistinguishingBlobAccess;

/// a blob being streamed into or out of storage
pub type BlobReader = Box<dyn Read + Send>;

/// get/put/find-missing over byte-exact content
pub trait BlobAccess: Send + Sync {
    /// open a blob for reading
    fn get(&self, instance: &str, digest: &Digest) -> Result<BlobReader>;

    /// store a blob, consuming the reader
    fn put(&self, instance: &str, digest: &Digest, reader: BlobReader) -> Result<()>;

    /// return the subset of `digests` that is not present
    fn find_missing(&self, instance: &str, digests: &[Digest]) -> Result<Vec<Digest>>;

    /// commit writes this store has buffered
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// read a whole blob into memory
///
/// nothing is returned unless the entire blob was read and validated.
pub fn read_blob(blob_access: &dyn BlobAccess, instance: &str, digest: &Digest) -> Result<Vec<u8>> {
    let mut reader = blob_access.get(instance, digest)?;
    let mut data = Vec::with_capacity(digest.size().min(1 << 20) as usize);
    reader.read_to_end(&mut data).map_err(Error::from_stream)?;
    Ok(data)
}

/// store an in-memory buffer under the given digest
pub fn put_bytes(
    blob_access: &dyn BlobAccess,
    instance: &str,
    digest: &Digest,
    data: Vec<u8>,
) -> Result<()> {
    blob_access.put(instance, digest, Box::new(Cursor::new(data)))
}

/// fetch and decode a protocol object
pub fn get_message<T: DeserializeOwned>(
    blob_access: &dyn BlobAccess,
    instance: &str,
    digest: &Digest,
) -> Result<T> {
    let data = read_blob(blob_access, instance, digest)?;
    decode_message(&data)
}

/// encode a protocol object and store it under its own digest
pub fn put_message<T: Serialize>(
    blob_access: &dyn BlobAccess,
    instance: &str,
    message: &T,
) -> Result<Digest> {
    let data = encode_message(message)?;
    let digest = Digest::of_bytes(&data);
    put_bytes(blob_access, instance, &digest, data)?;
    Ok(digest)
}

/// read a put stream to the end, mapping failures to typed errors
pub(crate) fn drain(reader: &mut BlobReader) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data).map_err(Error::from_stream)?;
    Ok(data)
}
