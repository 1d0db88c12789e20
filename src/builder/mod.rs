//! execution scheduling and running
//!
//! two contracts meet here. a [`BuildExecutor`] runs one action and returns
//! one response; a [`BuildQueue`] accepts execution requests and hands out
//! [`Operation`]s that can be watched until they complete.
//!
//! a monolithic deployment stacks them like this:
//!
//! ```text
//! CachedBuildQueue            action cache lookup
//!   WorkerBuildQueue          dedup, backpressure, FIFO dispatch
//!     CachingBuildExecutor    action cache write
//!       LocalBuildExecutor    stage inputs, run, upload outputs
//! ```

mod cached_build_queue;
mod caching;
mod demultiplexing;
mod local;
mod path;
pub mod worker;
mod worker_build_queue;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{ExecuteRequest, ExecuteResponse, Operation};

pub use cached_build_queue::CachedBuildQueue;
pub use caching::CachingBuildExecutor;
pub use demultiplexing::DemultiplexingBuildQueue;
pub use local::LocalBuildExecutor;
pub use path::join_within;
pub use worker_build_queue::{DispatchedJob, WorkerBuildQueue};

/// runs a single action
///
/// failures to run the action are reported inside the response, never as a
/// separate error, so that every dispatched job can be completed.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn execute(&self, request: &ExecuteRequest, cancel: &CancellationToken)
        -> ExecuteResponse;
}

#[async_trait]
pub trait BuildQueue: Send + Sync {
    /// submit a request, returning the snapshot of the job that serves it
    async fn execute(&self, request: ExecuteRequest) -> Result<Operation>;

    /// follow a job by name
    fn watch(&self, name: &str) -> Result<OperationWatcher>;
}

/// long-poll view of one job
///
/// the first call to [`next`](Self::next) yields the state at the time the
/// watcher was created; later calls wait for the next change. the stream ends
/// after yielding a completed operation. dropping the watcher has no effect
/// on the job.
pub struct OperationWatcher {
    receiver: watch::Receiver<Operation>,
    name_prefix: Option<String>,
    started: bool,
    finished: bool,
}

impl OperationWatcher {
    pub fn new(receiver: watch::Receiver<Operation>) -> Self {
        Self {
            receiver,
            name_prefix: None,
            started: false,
            finished: false,
        }
    }

    /// report operation names as `prefix|name`
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// next state update, or `None` once the job completed or was dropped
    pub async fn next(&mut self) -> Option<Operation> {
        if self.finished {
            return None;
        }
        if self.started && self.receiver.changed().await.is_err() {
            self.finished = true;
            return None;
        }
        self.started = true;

        let mut operation = self.receiver.borrow_and_update().clone();
        if operation.is_done() {
            self.finished = true;
        }
        if let Some(prefix) = &self.name_prefix {
            operation.name = format!("{}{}{}", prefix, crate::digest::KEY_SEPARATOR, operation.name);
        }
        Some(operation)
    }

    /// follow the job to completion
    pub async fn wait(mut self) -> Result<Operation> {
        let mut last = None;
        while let Some(operation) = self.next().await {
            last = Some(operation);
        }
        match last {
            Some(operation) if operation.is_done() => Ok(operation),
            _ => Err(Error::Unavailable(
                "job was dropped before it completed".to_string(),
            )),
        }
    }
}
