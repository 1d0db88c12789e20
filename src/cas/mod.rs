//! typed access to content-addressable storage
//!
//! [`ContentAddressableStorage`] lifts the byte-level [`BlobAccess`] contract
//! to protocol objects and local files. the executor talks to it through a
//! stack of decorators:
//!
//! ```text
//! HardlinkingContentAddressableStorage       files materialized once, linked after
//!   DirectoryCachingContentAddressableStorage  parsed directories memoized
//!     BlobAccessContentAddressableStorage      serialization + file streaming
//!       BlobAccess chain
//! ```
//!
//! [`BlobAccess`]: crate::blobstore::BlobAccess

mod blob_access;
mod directory_caching;
mod eviction;
mod hardlinking;
mod upload;

use std::path::Path;

use crate::digest::Digest;
use crate::error::Result;
use crate::types::{Command, Directory, Tree};

pub use blob_access::BlobAccessContentAddressableStorage;
pub use directory_caching::DirectoryCachingContentAddressableStorage;
pub use hardlinking::HardlinkingContentAddressableStorage;
pub use upload::build_tree;

pub trait ContentAddressableStorage: Send + Sync {
    fn get_command(&self, instance: &str, digest: &Digest) -> Result<Command>;

    fn get_directory(&self, instance: &str, digest: &Digest) -> Result<Directory>;

    /// materialize a blob at `path`, which must not exist yet
    ///
    /// the file is read-only, with execute bits when `is_executable`. a
    /// partially written file is removed on error.
    fn get_file(&self, instance: &str, digest: &Digest, path: &Path, is_executable: bool)
        -> Result<()>;

    /// upload a local file, returning its digest and executable bit
    fn put_file(&self, instance: &str, path: &Path) -> Result<(Digest, bool)>;

    /// store a whole tree as a single object
    fn put_tree(&self, instance: &str, tree: &Tree) -> Result<Digest>;

    /// commit buffered uploads
    fn flush(&self) -> Result<()>;
}

/// permission bits for a materialized input file
pub(crate) fn file_mode(is_executable: bool) -> u32 {
    if is_executable {
        0o555
    } else {
        0o444
    }
}
