use sha2::{Digest as _, Sha256};
use std::fmt;

use crate::Error;

/// SHA-256 checksum used for content addressing
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// length of a checksum in bytes
    pub const LEN: usize = 32;

    /// parse from hex string
    ///
    /// only lowercase hex is accepted, so that a digest has exactly one
    /// spelling and keys derived from it never alias.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.bytes().any(|c| c.is_ascii_uppercase()) {
            return Err(Error::InvalidDigest(format!(
                "hash must be lowercase hex: {}",
                s
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|_| Error::InvalidDigest(format!("hash is not valid hex: {}", s)))?;
        if bytes.len() != Self::LEN {
            return Err(Error::InvalidDigest(format!(
                "expected hash to be {} bytes; not {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// checksum of an in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// split into path components for an on-disk object store
    /// returns (first 2 hex chars, remaining 62 hex chars)
    pub fn to_path_components(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[..2].to_string(), hex[2..].to_string())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..12])
    }
}

/// streaming hasher that also counts the bytes it has seen
#[derive(Clone, Default)]
pub struct Hasher {
    hasher: Sha256,
    len: u64,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// feed content bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// number of bytes fed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    /// true if no bytes have been fed
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// finalize and return hash
    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl std::io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
