use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::builder::{BuildExecutor, BuildQueue, OperationWatcher};
use crate::config::SchedulerConfig;
use crate::digest::DigestKeyer;
use crate::error::{Error, Result, Status};
use crate::types::{ExecuteRequest, ExecuteResponse, Operation, OperationResult, Stage};

/// in-memory job scheduler
///
/// identical requests (same instance and action digest) submitted while a
/// job for them is queued or executing share that job. jobs are dispatched
/// in submission order, either to an in-process executor
/// ([`run_local`](Self::run_local)) or to remote workers
/// ([`serve_worker`](Self::serve_worker)).
///
/// all bookkeeping sits behind one lock, which is never held while an action
/// runs. queued jobs are not persisted.
pub struct WorkerBuildQueue {
    deduplication_keyer: DigestKeyer,
    max_pending_jobs: usize,
    completed_retention: Duration,
    state: Mutex<QueueState>,
    work_available: Notify,
}

#[derive(Default)]
struct QueueState {
    jobs_by_name: HashMap<String, Job>,
    jobs_by_dedup_key: HashMap<String, String>,
    pending: VecDeque<String>,
    completed: VecDeque<(Instant, String)>,
}

struct Job {
    dedup_key: String,
    request: ExecuteRequest,
    operation: watch::Sender<Operation>,
}

/// a job handed to an executor
#[derive(Clone, Debug)]
pub struct DispatchedJob {
    pub name: String,
    pub request: ExecuteRequest,
}

impl WorkerBuildQueue {
    pub fn new(
        deduplication_keyer: DigestKeyer,
        max_pending_jobs: usize,
        completed_retention: Duration,
    ) -> Self {
        Self {
            deduplication_keyer,
            max_pending_jobs,
            completed_retention,
            state: Mutex::new(QueueState::default()),
            work_available: Notify::new(),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            DigestKeyer::WithInstance,
            config.max_pending_jobs,
            config.completed_retention(),
        )
    }

    /// number of jobs waiting for dispatch
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// wait for the oldest queued job and mark it executing
    ///
    /// returns `None` once `cancel` fires.
    pub async fn next_job(&self, cancel: &CancellationToken) -> Option<DispatchedJob> {
        self.next_job_until(cancel, std::future::pending()).await
    }

    /// like [`next_job`](Self::next_job), but also gives up once `stop`
    /// resolves while no job is queued
    async fn next_job_until(
        &self,
        cancel: &CancellationToken,
        stop: impl Future<Output = ()>,
    ) -> Option<DispatchedJob> {
        tokio::pin!(stop);
        loop {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            // register before checking, so a submission in between is not missed
            notified.as_mut().enable();

            if let Some(job) = self.try_dispatch() {
                return Some(job);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut stop => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// put a dispatched job that never reached an executor back at the head
    /// of the queue
    fn requeue(&self, name: &str) {
        let mut state = self.state.lock();
        let Some(job) = state.jobs_by_name.get(name) else {
            return;
        };
        if job.operation.borrow().is_done() {
            return;
        }
        job.operation.send_modify(|op| op.stage = Stage::Queued);
        state.pending.push_front(name.to_string());
        drop(state);

        tracing::info!(job = %name, "job requeued");
        self.work_available.notify_waiters();
    }

    fn try_dispatch(&self) -> Option<DispatchedJob> {
        let mut state = self.state.lock();
        while let Some(name) = state.pending.pop_front() {
            let Some(job) = state.jobs_by_name.get(&name) else {
                continue;
            };
            job.operation.send_modify(|op| op.stage = Stage::Executing);
            tracing::info!(job = %name, instance = %job.request.instance_name, "job dispatched");
            return Some(DispatchedJob {
                name,
                request: job.request.clone(),
            });
        }
        None
    }

    /// record the outcome of a dispatched job and wake its watchers
    pub fn complete(&self, name: &str, result: OperationResult) -> Result<()> {
        let mut state = self.state.lock();
        let job = state
            .jobs_by_name
            .get(name)
            .ok_or_else(|| Error::OperationNotFound(name.to_string()))?;
        if job.operation.borrow().is_done() {
            return Err(Error::InvalidArgument(format!(
                "job {} has already completed",
                name
            )));
        }

        let dedup_key = job.dedup_key.clone();
        let action_digest = job.operation.borrow().action_digest.clone();
        let success = matches!(&result, OperationResult::Response(r) if r.is_ok());
        job.operation
            .send_replace(Operation::completed(name, action_digest, result));

        if state.jobs_by_dedup_key.get(&dedup_key).map(String::as_str) == Some(name) {
            state.jobs_by_dedup_key.remove(&dedup_key);
        }
        state.completed.push_back((Instant::now(), name.to_string()));
        tracing::info!(job = %name, success, "job completed");
        Ok(())
    }

    /// run queued jobs on an in-process executor until `cancel` fires
    pub async fn run_local(&self, executor: &dyn BuildExecutor, cancel: &CancellationToken) {
        while let Some(job) = self.next_job(cancel).await {
            let response = executor.execute(&job.request, cancel).await;
            if let Err(e) = self.complete(&job.name, OperationResult::Response(response)) {
                tracing::warn!(job = %job.name, error = %e, "failed to complete job");
            }
        }
    }

    /// feed queued jobs to one remote worker over a request/response stream
    ///
    /// the worker answers each request before receiving the next. a worker
    /// that goes away while idle ends the loop with `Ok`, and a job it never
    /// received goes back to the head of the queue. if it goes away mid-job,
    /// that job completes as unavailable so watchers are released, and an
    /// error is returned. cancellation returns `Ok`.
    pub async fn serve_worker(
        &self,
        to_worker: mpsc::Sender<ExecuteRequest>,
        mut from_worker: mpsc::Receiver<ExecuteResponse>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            if to_worker.is_closed() {
                tracing::debug!("worker disconnected while idle");
                return Ok(());
            }
            let Some(job) = self.next_job_until(cancel, to_worker.closed()).await else {
                return Ok(());
            };
            if to_worker.send(job.request.clone()).await.is_err() {
                self.requeue(&job.name);
                return Ok(());
            }
            let response = tokio::select! {
                response = from_worker.recv() => response,
                _ = cancel.cancelled() => {
                    self.complete(&job.name, OperationResult::Error(Status::from(Error::Cancelled)))?;
                    return Ok(());
                }
            };
            match response {
                Some(response) => self.complete(&job.name, OperationResult::Response(response))?,
                None => {
                    return self.abandon(
                        &job.name,
                        Error::Unavailable("worker disconnected while executing".into()),
                    )
                }
            }
        }
    }

    fn abandon(&self, name: &str, err: Error) -> Result<()> {
        tracing::warn!(job = %name, error = %err, "worker lost");
        self.complete(name, OperationResult::Error(Status::from(&err)))?;
        Err(err)
    }

    fn purge_expired(&self, state: &mut QueueState) {
        let now = Instant::now();
        while let Some((completed_at, _)) = state.completed.front() {
            if now.duration_since(*completed_at) < self.completed_retention {
                break;
            }
            if let Some((_, name)) = state.completed.pop_front() {
                state.jobs_by_name.remove(&name);
            }
        }
    }
}

#[async_trait]
impl BuildQueue for WorkerBuildQueue {
    async fn execute(&self, request: ExecuteRequest) -> Result<Operation> {
        let action_digest = request.action.digest()?;
        let dedup_key = self
            .deduplication_keyer
            .key(&request.instance_name, &action_digest)?;

        let mut state = self.state.lock();
        self.purge_expired(&mut state);

        if let Some(name) = state.jobs_by_dedup_key.get(&dedup_key) {
            if let Some(job) = state.jobs_by_name.get(name) {
                return Ok(job.operation.borrow().clone());
            }
        }
        if state.pending.len() >= self.max_pending_jobs {
            return Err(Error::QueueFull(self.max_pending_jobs));
        }

        let name = uuid::Uuid::new_v4().to_string();
        let operation = Operation::queued(&name, action_digest);
        let (sender, _) = watch::channel(operation.clone());
        state.jobs_by_name.insert(
            name.clone(),
            Job {
                dedup_key: dedup_key.clone(),
                request,
                operation: sender,
            },
        );
        state.jobs_by_dedup_key.insert(dedup_key, name.clone());
        state.pending.push_back(name.clone());
        drop(state);

        tracing::info!(job = %name, action = %operation.action_digest, "job queued");
        self.work_available.notify_waiters();
        Ok(operation)
    }

    fn watch(&self, name: &str) -> Result<OperationWatcher> {
        let mut state = self.state.lock();
        self.purge_expired(&mut state);
        let job = state
            .jobs_by_name
            .get(name)
            .ok_or_else(|| Error::OperationNotFound(name.to_string()))?;
        Ok(OperationWatcher::new(job.operation.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::types::{Action, ActionResult};
    use std::sync::Arc;

    fn request(name: &str) -> ExecuteRequest {
        ExecuteRequest::new(
            "main",
            Action {
                command_digest: Digest::of_bytes(name.as_bytes()),
                input_root_digest: Digest::of_bytes(b""),
                output_files: vec![],
                output_directories: vec![],
                do_not_cache: false,
            },
        )
    }

    fn queue(capacity: usize) -> WorkerBuildQueue {
        WorkerBuildQueue::new(DigestKeyer::WithInstance, capacity, Duration::from_secs(60))
    }

    fn success() -> OperationResult {
        OperationResult::Response(ExecuteResponse::from_result(ActionResult::default()))
    }

    #[tokio::test]
    async fn test_identical_requests_share_a_job() {
        let queue = queue(4);
        let first = queue.execute(request("a")).await.unwrap();
        let second = queue.execute(request("a")).await.unwrap();
        assert_eq!(first.name, second.name);
        assert_eq!(queue.pending_len(), 1);

        // another instance is another job
        let mut other = request("a");
        other.instance_name = "other".into();
        let third = queue.execute(other).await.unwrap();
        assert_ne!(first.name, third.name);
    }

    #[tokio::test]
    async fn test_dedup_ends_when_job_completes() {
        let queue = queue(4);
        let cancel = CancellationToken::new();
        let first = queue.execute(request("a")).await.unwrap();

        let job = queue.next_job(&cancel).await.unwrap();
        assert_eq!(job.name, first.name);
        // executing jobs still deduplicate
        assert_eq!(queue.execute(request("a")).await.unwrap().name, first.name);

        queue.complete(&job.name, success()).unwrap();
        let again = queue.execute(request("a")).await.unwrap();
        assert_ne!(again.name, first.name);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let queue = queue(2);
        queue.execute(request("a")).await.unwrap();
        queue.execute(request("b")).await.unwrap();

        let result = queue.execute(request("c")).await;
        assert!(matches!(result, Err(Error::QueueFull(2))));
        assert_eq!(queue.pending_len(), 2);

        // resubmitting a queued action is not new work
        assert!(queue.execute(request("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_fifo_dispatch() {
        let queue = queue(8);
        let cancel = CancellationToken::new();
        let names: Vec<String> = submit_all(&queue, &["a", "b", "c"]).await;

        for expected in names {
            let job = queue.next_job(&cancel).await.unwrap();
            assert_eq!(job.name, expected);
        }
    }

    async fn submit_all(queue: &WorkerBuildQueue, actions: &[&str]) -> Vec<String> {
        let mut names = Vec::new();
        for action in actions {
            names.push(queue.execute(request(action)).await.unwrap().name);
        }
        names
    }

    #[tokio::test]
    async fn test_next_job_wakes_on_submit() {
        let queue = Arc::new(queue(4));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.next_job(&cancel).await })
        };
        tokio::task::yield_now().await;

        let op = queue.execute(request("a")).await.unwrap();
        let job = waiter.await.unwrap().unwrap();
        assert_eq!(job.name, op.name);
    }

    #[tokio::test]
    async fn test_next_job_exits_on_cancel() {
        let queue = queue(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.next_job(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_watch_follows_job_to_completion() {
        let queue = Arc::new(queue(4));
        let cancel = CancellationToken::new();
        let op = queue.execute(request("a")).await.unwrap();

        let mut watcher = queue.watch(&op.name).unwrap();
        assert_eq!(watcher.next().await.unwrap().stage, Stage::Queued);

        let job = queue.next_job(&cancel).await.unwrap();
        assert_eq!(watcher.next().await.unwrap().stage, Stage::Executing);

        queue.complete(&job.name, success()).unwrap();
        let last = watcher.next().await.unwrap();
        assert_eq!(last.stage, Stage::Completed);
        assert!(last.response().is_some());
        assert!(watcher.next().await.is_none());

        // a watch started after completion yields the final state at once
        let done = queue.watch(&op.name).unwrap().wait().await.unwrap();
        assert!(done.is_done());
    }

    #[tokio::test]
    async fn test_watch_unknown_job() {
        let queue = queue(4);
        assert!(matches!(
            queue.watch("nope"),
            Err(Error::OperationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_twice_rejected() {
        let queue = queue(4);
        let cancel = CancellationToken::new();
        queue.execute(request("a")).await.unwrap();
        let job = queue.next_job(&cancel).await.unwrap();

        queue.complete(&job.name, success()).unwrap();
        assert!(queue.complete(&job.name, success()).is_err());
        assert!(queue.complete("unknown", success()).is_err());
    }

    #[tokio::test]
    async fn test_completed_jobs_are_purged_after_retention() {
        let queue = WorkerBuildQueue::new(DigestKeyer::WithInstance, 4, Duration::ZERO);
        let cancel = CancellationToken::new();
        let op = queue.execute(request("a")).await.unwrap();
        let job = queue.next_job(&cancel).await.unwrap();
        queue.complete(&job.name, success()).unwrap();

        assert!(matches!(
            queue.watch(&op.name),
            Err(Error::OperationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_instance_name_rejected() {
        let queue = queue(4);
        let mut bad = request("a");
        bad.instance_name = "a|b".into();
        assert!(matches!(
            queue.execute(bad).await,
            Err(Error::InvalidInstanceName(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_worker_relays_responses() {
        let queue = Arc::new(queue(4));
        let cancel = CancellationToken::new();
        let (req_tx, mut req_rx) = mpsc::channel(1);
        let (resp_tx, resp_rx) = mpsc::channel(1);

        let server = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.serve_worker(req_tx, resp_rx, &cancel).await })
        };

        let op = queue.execute(request("a")).await.unwrap();
        let received = req_rx.recv().await.unwrap();
        assert_eq!(received, request("a"));
        resp_tx
            .send(ExecuteResponse::from_result(ActionResult::default()))
            .await
            .unwrap();

        let done = queue.watch(&op.name).unwrap().wait().await.unwrap();
        assert!(done.response().unwrap().is_ok());

        cancel.cancel();
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_serve_worker_disconnect_releases_watchers() {
        let queue = Arc::new(queue(4));
        let cancel = CancellationToken::new();
        let (req_tx, mut req_rx) = mpsc::channel(1);
        let (resp_tx, resp_rx) = mpsc::channel::<ExecuteResponse>(1);

        let server = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.serve_worker(req_tx, resp_rx, &cancel).await })
        };

        let op = queue.execute(request("a")).await.unwrap();
        req_rx.recv().await.unwrap();
        drop(resp_tx);

        let done = queue.watch(&op.name).unwrap().wait().await.unwrap();
        match done.result {
            Some(OperationResult::Error(status)) => {
                assert_eq!(status.code, crate::error::Code::Unavailable)
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(server.await.unwrap(), Err(Error::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_idle_worker_disconnect_leaves_jobs_queued() {
        let queue = Arc::new(queue(4));
        let cancel = CancellationToken::new();
        let (req_tx, req_rx) = mpsc::channel::<ExecuteRequest>(1);
        let (_resp_tx, resp_rx) = mpsc::channel::<ExecuteResponse>(1);

        let server = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.serve_worker(req_tx, resp_rx, &cancel).await })
        };
        tokio::task::yield_now().await;
        drop(req_rx);
        assert!(server.await.unwrap().is_ok());

        let op = queue.execute(request("a")).await.unwrap();
        assert_eq!(op.stage, Stage::Queued);
        assert_eq!(queue.pending_len(), 1);
        let mut watcher = queue.watch(&op.name).unwrap();
        let seen = watcher.next().await.unwrap();
        assert_eq!(seen.stage, Stage::Queued);
        assert!(seen.result.is_none());

        // a healthy dispatcher still gets the job
        let job = queue.next_job(&cancel).await.unwrap();
        assert_eq!(job.name, op.name);
    }

    #[tokio::test]
    async fn test_closed_worker_does_not_take_queued_job() {
        let queue = queue(4);
        let cancel = CancellationToken::new();
        let op = queue.execute(request("a")).await.unwrap();

        let (req_tx, req_rx) = mpsc::channel::<ExecuteRequest>(1);
        let (_resp_tx, resp_rx) = mpsc::channel::<ExecuteResponse>(1);
        drop(req_rx);
        assert!(queue.serve_worker(req_tx, resp_rx, &cancel).await.is_ok());

        assert_eq!(queue.pending_len(), 1);
        let current = queue.watch(&op.name).unwrap().next().await.unwrap();
        assert_eq!(current.stage, Stage::Queued);
    }

    #[tokio::test]
    async fn test_requeued_job_goes_back_to_the_head() {
        let queue = queue(4);
        let cancel = CancellationToken::new();
        let names = submit_all(&queue, &["a", "b"]).await;

        let job = queue.next_job(&cancel).await.unwrap();
        assert_eq!(job.name, names[0]);
        queue.requeue(&job.name);

        let current = queue.watch(&job.name).unwrap().next().await.unwrap();
        assert_eq!(current.stage, Stage::Queued);
        assert_eq!(queue.pending_len(), 2);
        assert_eq!(queue.next_job(&cancel).await.unwrap().name, names[0]);
        assert_eq!(queue.next_job(&cancel).await.unwrap().name, names[1]);
    }
}
