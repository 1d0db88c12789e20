use std::io::{self, Read};
use std::sync::Arc;

use crate::blobstore::{BlobAccess, BlobReader};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::hash::{Hash, Hasher};

/// content-addressing integrity decorator
///
/// every stream passing through it in either direction is checked against
/// the digest it travels under: digests are validated up front, lengths as
/// bytes arrive and the checksum at end of stream.
pub struct MerkleBlobAccess {
    base: Arc<dyn BlobAccess>,
}

impl MerkleBlobAccess {
    pub fn new(base: Arc<dyn BlobAccess>) -> Self {
        Self { base }
    }
}

impl BlobAccess for MerkleBlobAccess {
    fn get(&self, instance: &str, digest: &Digest) -> Result<BlobReader> {
        let (hash, size) = digest.parse()?;
        let reader = self.base.get(instance, digest)?;
        Ok(Box::new(ValidatingReader::new(reader, hash, size)))
    }

    fn put(&self, instance: &str, digest: &Digest, reader: BlobReader) -> Result<()> {
        let (hash, size) = digest.parse()?;
        self.base.put(
            instance,
            digest,
            Box::new(ValidatingReader::new(reader, hash, size)),
        )
    }

    fn find_missing(&self, instance: &str, digests: &[Digest]) -> Result<Vec<Digest>> {
        for digest in digests {
            digest.parse()?;
        }
        self.base.find_missing(instance, digests)
    }

    fn flush(&self) -> Result<()> {
        self.base.flush()
    }
}

/// reader that fails unless the stream matches an expected hash and size
///
/// a stream longer than expected fails on the read that crosses the limit;
/// a short stream or a checksum mismatch fails at end of stream. an error is
/// sticky: once reported, every further read fails as well.
pub struct ValidatingReader<R> {
    inner: R,
    expected: Hash,
    size_left: u64,
    hasher: Hasher,
    state: ReadState,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Reading,
    Verified,
    Failed,
}

impl<R: Read> ValidatingReader<R> {
    pub fn new(inner: R, expected: Hash, size: u64) -> Self {
        Self {
            inner,
            expected,
            size_left: size,
            hasher: Hasher::new(),
            state: ReadState::Reading,
        }
    }

    fn fail(&mut self, err: Error) -> io::Error {
        self.state = ReadState::Failed;
        err.into_stream()
    }

    fn finish(&mut self) -> io::Result<usize> {
        if self.size_left > 0 {
            return Err(self.fail(Error::BlobTooShort(self.size_left)));
        }
        let actual = std::mem::take(&mut self.hasher).finalize();
        if actual != self.expected {
            return Err(self.fail(Error::HashMismatch {
                expected: self.expected.to_hex(),
                actual: actual.to_hex(),
            }));
        }
        self.state = ReadState::Verified;
        Ok(0)
    }
}

impl<R: Read> Read for ValidatingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.state {
            ReadState::Verified => return Ok(0),
            ReadState::Failed => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "blob failed validation",
                ))
            }
            ReadState::Reading => {}
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let n = match self.inner.read(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
            Err(e) => {
                self.state = ReadState::Failed;
                return Err(e);
            }
        };
        if n == 0 {
            return self.finish();
        }
        if n as u64 > self.size_left {
            let excess = n as u64 - self.size_left;
            return Err(self.fail(Error::BlobTooLong(excess)));
        }

        self.hasher.update(&buf[..n]);
        self.size_left -= n as u64;
        Ok(n)
    }
}
