//! Server assembly: acceptor loop, admission control, worker dispatch,
//! periodic statistics, and graceful shutdown.
//!
//! # Overview
//!
//! [`Server::bind`] opens the listener and the access log (both fatal on
//! failure); [`Server::serve`] spawns the worker tiers and runs the
//! accept loop until the shutdown flag flips, then drains: the admission
//! queue closes, the per-worker channels close, every worker finishes
//! its queued jobs, and the log is flushed.
//!
//! Per accepted connection the acceptor makes a single non-blocking
//! admission attempt; a saturated queue answers 503 directly. Admitted
//! connections are dispatched round-robin: the k-th admitted connection
//! goes to worker `k mod N`.

mod admission;
mod handler;
mod worker;

pub use admission::{AdmissionQueue, AdmissionToken};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::access_log::AccessLog;
use crate::cache::FileCache;
use crate::config::Config;
use crate::stats::{ServerStats, format_summary};
use worker::{Job, WorkerContext};

/// How often the statistics summary is printed.
const STATS_PRINT_INTERVAL: Duration = Duration::from_secs(30);

/// Fatal startup errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The access log could not be opened.
    #[error("failed to open access log {path}: {source}")]
    Log {
        /// The configured log path.
        path: std::path::PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// A bound, not-yet-serving server.
pub struct Server {
    config: Config,
    listener: TcpListener,
    log: Arc<AccessLog>,
}

impl Server {
    /// Binds the listener and opens the access log.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Log`] or [`ServerError::Bind`]; both are
    /// startup failures the binary reports with exit code 1.
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        let log = AccessLog::open(&config.log_file).map_err(|source| ServerError::Log {
            path: config.log_file.clone(),
            source,
        })?;

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!(
            addr = %listener.local_addr().map_or_else(|_| addr.to_string(), |a| a.to_string()),
            document_root = %config.document_root.display(),
            workers = config.num_workers,
            threads_per_worker = config.threads_per_worker,
            queue_capacity = config.max_queue_size,
            "server initialized"
        );

        Ok(Self {
            config,
            listener,
            log: Arc::new(log),
        })
    }

    /// The bound address; useful when the configured port was zero.
    ///
    /// # Errors
    ///
    /// Propagates the socket's `local_addr` failure.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts and dispatches until `shutdown` flips true, then drains
    /// and joins every worker before returning.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let Self {
            config,
            listener,
            log,
        } = self;

        let stats = Arc::new(ServerStats::new());
        let admission = Arc::new(AdmissionQueue::new(config.max_queue_size));

        let all_caches: Arc<[Arc<FileCache>]> = (0..config.num_workers)
            .map(|_| FileCache::new(config.per_worker_cache_bytes()))
            .collect::<Vec<_>>()
            .into();

        let mut conn_senders = Vec::with_capacity(config.num_workers);
        let mut workers = Vec::with_capacity(config.num_workers);
        for worker_id in 0..config.num_workers {
            let (conn_tx, conn_rx) = mpsc::unbounded_channel();
            let ctx = Arc::new(WorkerContext {
                worker_id,
                document_root: config.document_root.clone(),
                cache: Arc::clone(&all_caches[worker_id]),
                all_caches: Arc::clone(&all_caches),
                log: Arc::clone(&log),
                stats: Arc::clone(&stats),
            });
            workers.push(tokio::spawn(worker::run_worker(
                Arc::clone(&admission),
                conn_rx,
                ctx,
                config.threads_per_worker,
                config.max_queue_size,
            )));
            conn_senders.push(conn_tx);
        }

        let printer = tokio::spawn(print_stats_periodically(
            Arc::clone(&stats),
            Arc::clone(&all_caches),
            shutdown.clone(),
        ));

        info!("serving");
        let mut next_worker = 0;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            dispatch(
                                stream,
                                peer,
                                &admission,
                                &conn_senders,
                                &mut next_worker,
                            );
                        }
                        Err(error) => warn!(%error, "accept failed"),
                    }
                }
            }
        }

        info!("draining");
        drop(listener);
        admission.close();
        drop(conn_senders);
        for handle in workers {
            if let Err(error) = handle.await {
                warn!(%error, "worker task panicked");
            }
        }
        debug!("workers joined");

        let _ = printer.await;
        let cache_stats: Vec<_> = all_caches.iter().map(|cache| cache.stats()).collect();
        info!(summary = %format_summary(&stats.snapshot(), &cache_stats), "final statistics");
        log.flush();
        info!("shutdown complete");
    }
}

/// Admission control plus round-robin handover for one connection.
fn dispatch(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    admission: &AdmissionQueue,
    conn_senders: &[mpsc::UnboundedSender<Job>],
    next_worker: &mut usize,
) {
    let worker_id = *next_worker;
    if !admission.try_admit(AdmissionToken { worker_id }) {
        debug!(peer = %peer, depth = admission.depth(), "admission queue full, rejecting");
        // Answer off the accept loop so a slow client cannot stall it.
        tokio::spawn(async move {
            let mut stream = stream;
            handler::write_service_unavailable(&mut stream).await;
        });
        return;
    }

    *next_worker = (worker_id + 1) % conn_senders.len();
    if let Err(error) = conn_senders[worker_id].send(Job { stream, peer }) {
        // Worker gone (only happens during teardown); the connection is
        // dropped and its undelivered slot is released with the queue.
        warn!(worker_id, %error, "worker channel closed, dropping connection");
    }
}

/// Emits a statistics summary every 30 seconds until shutdown.
async fn print_stats_periodically(
    stats: Arc<ServerStats>,
    caches: Arc<[Arc<FileCache>]>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(STATS_PRINT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so the first summary
    // carries 30 seconds of traffic.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cache_stats: Vec<_> = caches.iter().map(|cache| cache.stats()).collect();
                info!(summary = %format_summary(&stats.snapshot(), &cache_stats), "statistics");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
