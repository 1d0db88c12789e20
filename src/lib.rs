//! casexec - remote build execution core
//!
//! content-addressed storage with streaming integrity checks, a deduplicating
//! job scheduler and a local action executor.
//!
//! # Core concepts
//!
//! - **Digest**: lowercase hex SHA-256 plus exact size in bytes; names every blob
//! - **BlobAccess**: byte store keyed by digest (and optionally instance name)
//! - **CAS**: typed view over a blob store: commands, directories, files, trees
//! - **Action cache**: action digest to previously computed result
//! - **Build queue**: accepts requests, deduplicates them into jobs, reports
//!   progress as watchable operations
//! - **Build executor**: runs one action and returns one response
//!
//! # Storage stack
//!
//! ```text
//! BatchWritingBlobAccess        find_missing before upload
//!   MerkleBlobAccess            every byte in and out checked against its digest
//!     SizeDistinguishingBlobAccess
//!       small: DiskBlobAccess
//!       large: DiskBlobAccess
//! ```
//!
//! # Example usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use casexec::blobstore::{put_message, MemoryBlobAccess, MerkleBlobAccess};
//! use casexec::builder::{BuildQueue, WorkerBuildQueue};
//! use casexec::{Action, Command, Directory, DigestKeyer, ExecuteRequest};
//!
//! # async fn run() -> casexec::Result<()> {
//! let blobs = Arc::new(MerkleBlobAccess::new(Arc::new(MemoryBlobAccess::new(
//!     DigestKeyer::WithoutInstance,
//! ))));
//! let command_digest = put_message(blobs.as_ref(), "", &Command::new(["/bin/true"]))?;
//! let input_root_digest = put_message(blobs.as_ref(), "", &Directory::default())?;
//!
//! let queue = WorkerBuildQueue::new(DigestKeyer::WithInstance, 16, std::time::Duration::from_secs(60));
//! let op = queue
//!     .execute(ExecuteRequest::new("", Action {
//!         command_digest,
//!         input_root_digest,
//!         output_files: vec![],
//!         output_directories: vec![],
//!         do_not_cache: false,
//!     }))
//!     .await?;
//! let done = queue.watch(&op.name)?.wait().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod hash;

pub mod ac;
pub mod blobstore;
pub mod builder;
pub mod cas;
pub mod config;
pub mod digest;
pub mod fs;
pub mod types;

pub use config::Config;
pub use digest::{Digest, DigestKeyer};
pub use error::{Code, Error, IoResultExt, Result, Status};
pub use hash::{Hash, Hasher};
pub use types::{
    Action, ActionResult, Command, Directory, DirectoryNode, ExecuteRequest, ExecuteResponse,
    FileNode, Operation, OperationResult, OutputDirectory, OutputFile, Stage, Tree,
};
