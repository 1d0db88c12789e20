//! content identity and key derivation
//!
//! a [`Digest`] is both a lookup key and an integrity claim: the SHA-256 of a
//! blob plus its exact length. digests arrive from clients unvalidated, so the
//! fields are kept in their wire form and checked with [`Digest::parse`] before
//! they are trusted.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::Hash;

/// character separating the components of storage and deduplication keys
pub const KEY_SEPARATOR: char = '|';

/// content hash plus byte length identifying a blob
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    pub hash: String,
    pub size_bytes: i64,
}

impl Digest {
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
        }
    }

    /// digest of an in-memory buffer
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_parts(Hash::of(data), data.len() as u64)
    }

    /// digest of a protocol object, computed over its canonical encoding
    pub fn of_message<T: Serialize>(message: &T) -> Result<Self> {
        Ok(Self::of_bytes(&encode_message(message)?))
    }

    /// build a digest from an already verified checksum and length
    pub fn from_parts(hash: Hash, size_bytes: u64) -> Self {
        Self {
            hash: hash.to_hex(),
            size_bytes: size_bytes as i64,
        }
    }

    /// validate the digest fields, returning the checksum and size
    pub fn parse(&self) -> Result<(Hash, u64)> {
        let hash = Hash::from_hex(&self.hash)?;
        if self.size_bytes < 0 {
            return Err(Error::InvalidDigest(format!(
                "invalid negative size: {}",
                self.size_bytes
            )));
        }
        Ok((hash, self.size_bytes as u64))
    }

    /// size in bytes, with negative sizes clamped to zero
    pub fn size(&self) -> u64 {
        self.size_bytes.max(0) as u64
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

/// serialize a protocol object into its canonical CBOR encoding
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes)?;
    Ok(bytes)
}

/// decode a protocol object from its CBOR encoding
pub fn decode_message<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(ciborium::from_reader(data)?)
}

/// reject instance names that would corrupt composite keys
pub fn validate_instance_name(instance: &str) -> Result<()> {
    if instance.contains(KEY_SEPARATOR) {
        return Err(Error::InvalidInstanceName(format!(
            "instance name cannot contain '{}': {}",
            KEY_SEPARATOR, instance
        )));
    }
    Ok(())
}

/// how a digest is turned into a storage or deduplication key
///
/// CAS content is instance-agnostic since the hash alone determines identity;
/// action cache entries and jobs are scoped to their instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestKeyer {
    WithInstance,
    WithoutInstance,
}

impl DigestKeyer {
    pub fn key(&self, instance: &str, digest: &Digest) -> Result<String> {
        if !digest
            .hash
            .bytes()
            .all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c))
        {
            return Err(Error::InvalidDigest(format!(
                "blob hash can only contain lowercase hexadecimal characters: {}",
                digest.hash
            )));
        }
        match self {
            DigestKeyer::WithInstance => {
                validate_instance_name(instance)?;
                Ok(format!(
                    "{}{sep}{}{sep}{}",
                    digest.hash,
                    digest.size_bytes,
                    instance,
                    sep = KEY_SEPARATOR
                ))
            }
            DigestKeyer::WithoutInstance => Ok(format!(
                "{}{}{}",
                digest.hash, KEY_SEPARATOR, digest.size_bytes
            )),
        }
    }
}
