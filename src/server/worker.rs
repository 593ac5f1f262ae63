//! Worker tier: receiver loop, bounded job pool, and per-worker context.
//!
//! Each worker owns an unbounded channel of accepted connections fed by
//! the acceptor, and a pool of handler tasks fed by a bounded job queue.
//! The receiver loop waits on its own channel — never on the shared
//! admission gate, whose tokens are anonymous and could belong to
//! another worker's connection — acknowledges delivery to the admission
//! queue, and submits the connection to the pool; a full job queue
//! rejects it with a best-effort 503.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::access_log::AccessLog;
use crate::cache::FileCache;
use crate::server::admission::AdmissionQueue;
use crate::server::handler;
use crate::stats::ServerStats;

/// One accepted connection traveling through the dispatch pipeline.
///
/// The stream is owned by exactly one holder at a time and dropped
/// (closed) exactly once, at response completion or rejection.
#[derive(Debug)]
pub(crate) struct Job {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Everything a handler task needs, threaded explicitly rather than held
/// as process-global state.
pub(crate) struct WorkerContext {
    pub worker_id: usize,
    pub document_root: PathBuf,
    /// This worker's private cache.
    pub cache: Arc<FileCache>,
    /// Every worker's cache, for the aggregated stats endpoint.
    pub all_caches: Arc<[Arc<FileCache>]>,
    pub log: Arc<AccessLog>,
    pub stats: Arc<ServerStats>,
}

/// Why a submission was refused.
pub(crate) enum SubmitError {
    /// The job queue is at `max_jobs`; the caller answers 503.
    Full(Job),
    /// The pool is shutting down; the caller just drops the connection.
    Closed(Job),
}

/// Fixed set of handler tasks consuming a bounded FIFO job queue.
pub(crate) struct JobPool {
    job_tx: mpsc::Sender<Job>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl JobPool {
    /// Spawns `tasks` handler tasks over a queue bounded at `max_jobs`.
    ///
    /// The tasks share one receiver behind an async mutex; whichever
    /// task is idle takes the lock and blocks on `recv`, which keeps
    /// dequeue order FIFO with a single waiter at a time.
    pub fn spawn(tasks: usize, max_jobs: usize, ctx: Arc<WorkerContext>) -> Self {
        let (job_tx, job_rx) = mpsc::channel(max_jobs.max(1));
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        let handles = (0..tasks)
            .map(|task_id| {
                let job_rx = Arc::clone(&job_rx);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    loop {
                        let job = { job_rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        handler::handle_request(&ctx, job).await;
                    }
                    trace!(
                        worker_id = ctx.worker_id,
                        task_id, "handler task exiting"
                    );
                })
            })
            .collect();

        Self { job_tx, handles }
    }

    /// Non-blocking submission.
    ///
    /// # Errors
    ///
    /// Returns the job back inside [`SubmitError`] when the queue is full
    /// or the pool is closed.
    pub fn submit(&self, job: Job) -> Result<(), SubmitError> {
        match self.job_tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err(SubmitError::Full(job)),
            Err(TrySendError::Closed(job)) => Err(SubmitError::Closed(job)),
        }
    }

    /// Closes the queue and waits for the handler tasks. Jobs already
    /// queued are drained and served before the tasks observe closure.
    pub async fn shutdown(self) {
        drop(self.job_tx);
        for handle in self.handles {
            if let Err(error) = handle.await {
                warn!(%error, "handler task panicked");
            }
        }
    }
}

/// Worker receiver loop: take the next connection off this worker's
/// channel, acknowledge its admission slot, then hand it to the pool.
///
/// Exits when the acceptor drops the channel; the pool is drained and
/// joined before return.
pub(crate) async fn run_worker(
    admission: Arc<AdmissionQueue>,
    mut conn_rx: mpsc::UnboundedReceiver<Job>,
    ctx: Arc<WorkerContext>,
    tasks: usize,
    max_jobs: usize,
) {
    let worker_id = ctx.worker_id;
    let pool = JobPool::spawn(tasks, max_jobs, Arc::clone(&ctx));
    debug!(worker_id, tasks, max_jobs, "worker started");

    loop {
        let Some(job) = conn_rx.recv().await else {
            break;
        };
        // The admission slot is held until its connection is picked up;
        // freeing it here is what lets the next connection in.
        let _ = admission.mark_delivered();
        match pool.submit(job) {
            Ok(()) => {}
            Err(SubmitError::Full(job)) => {
                debug!(worker_id, peer = %job.peer, "job queue full, rejecting");
                // Answer off the receiver loop so a slow client cannot
                // stall dispatch for this worker.
                tokio::spawn(async move {
                    let mut job = job;
                    handler::write_service_unavailable(&mut job.stream).await;
                });
            }
            Err(SubmitError::Closed(_)) => break,
        }
    }

    debug!(worker_id, "worker draining");
    pool.shutdown().await;
    debug!(worker_id, "worker exited");
}
