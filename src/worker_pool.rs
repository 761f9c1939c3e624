//! # Worker Pool Module
//!
//! A fixed set of OS worker threads draining a bounded queue.
//!
//! ## Features
//!
//! - **Bounded hand-off**: jobs go through a `crossbeam` bounded MPMC channel;
//!   [`WorkerPool::try_dispatch`] never blocks and reports a full queue to the caller
//! - **Load Balancing**: all workers receive from the same channel
//! - **Panic isolation**: a panicking job is logged and the worker moves on
//! - **Metrics**: accepted, refused, active and completed counters
//!
//! The server uses one pool whose jobs are accepted TCP connections; a worker
//! runs one connection loop to completion before taking the next.

use crossbeam::channel::{self, Sender, TrySendError};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use crate::config::ServerConfig;

/// Configuration for a worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker threads
    pub num_workers: usize,
    /// Jobs that may wait for a free worker
    pub queue_bound: usize,
}

impl WorkerPoolConfig {
    /// Create a custom configuration
    #[must_use]
    pub fn new(num_workers: usize, queue_bound: usize) -> Self {
        Self {
            num_workers,
            queue_bound,
        }
    }
}

impl From<&ServerConfig> for WorkerPoolConfig {
    fn from(config: &ServerConfig) -> Self {
        Self::new(config.workers, config.backlog)
    }
}

/// Metrics for a worker pool
#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    /// Jobs queued for a worker
    pub accepted_count: AtomicU64,
    /// Jobs turned away because the queue was full
    pub refused_count: AtomicU64,
    /// Jobs currently running
    pub active_count: AtomicUsize,
    /// Jobs finished, including those that panicked
    pub completed_count: AtomicU64,
}

impl WorkerPoolMetrics {
    /// Create new metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a queued job
    pub fn record_accept(&self) {
        self.accepted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refused job
    pub fn record_refused(&self) {
        self.refused_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a worker picking up a job
    pub fn record_start(&self) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job finishing
    pub fn record_completion(&self) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
        self.active_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get_accepted_count(&self) -> u64 {
        self.accepted_count.load(Ordering::Relaxed)
    }

    pub fn get_refused_count(&self) -> u64 {
        self.refused_count.load(Ordering::Relaxed)
    }

    pub fn get_active_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    pub fn get_completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }
}

/// Why [`WorkerPool::try_dispatch`] handed a job back
#[derive(Debug)]
pub enum DispatchError<J> {
    /// Every worker is busy and the queue is at its bound
    Full(J),
    /// The pool is shutting down
    Closed(J),
}

impl<J> DispatchError<J> {
    /// Recover the job that was not queued
    pub fn into_inner(self) -> J {
        match self {
            DispatchError::Full(job) | DispatchError::Closed(job) => job,
        }
    }
}

/// A pool of OS threads processing jobs of type `J`
pub struct WorkerPool<J> {
    config: WorkerPoolConfig,
    /// `None` once shutdown has started
    sender: Option<Sender<J>>,
    workers: Vec<JoinHandle<()>>,
    metrics: Arc<WorkerPoolMetrics>,
    name: String,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn `config.num_workers` threads that run `job_fn` on every received job
    ///
    /// # Errors
    ///
    /// Fails when a thread cannot be spawned; threads already started are shut
    /// down before returning.
    pub fn new<F>(name: &str, config: WorkerPoolConfig, metrics: Arc<WorkerPoolMetrics>, job_fn: F) -> io::Result<Self>
    where
        F: Fn(J) + Send + Sync + 'static,
    {
        let (tx, rx) = channel::bounded::<J>(config.queue_bound);
        let job_fn = Arc::new(job_fn);

        info!(
            pool = %name,
            num_workers = config.num_workers,
            queue_bound = config.queue_bound,
            "Creating worker pool"
        );

        let mut pool = Self {
            config,
            sender: Some(tx),
            workers: Vec::with_capacity(config.num_workers),
            metrics,
            name: name.to_string(),
        };

        for worker_id in 0..config.num_workers {
            let rx = rx.clone();
            let job_fn = Arc::clone(&job_fn);
            let metrics = Arc::clone(&pool.metrics);
            let pool_name = pool.name.clone();

            let spawned = thread::Builder::new()
                .name(format!("{name}-{worker_id}"))
                .spawn(move || {
                    debug!(pool = %pool_name, worker_id = worker_id, "Worker thread started");

                    // Ends when every sender is dropped and the queue is drained
                    for job in rx.iter() {
                        metrics.record_start();
                        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job_fn(job))) {
                            error!(
                                pool = %pool_name,
                                worker_id = worker_id,
                                panic_message = ?panic,
                                "Job panicked"
                            );
                        }
                        metrics.record_completion();
                    }

                    debug!(pool = %pool_name, worker_id = worker_id, "Worker thread exiting");
                });

            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    error!(pool = %name, worker_id = worker_id, error = %e, "Failed to spawn worker thread");
                    pool.shutdown();
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    /// Queue `job` without blocking
    ///
    /// # Errors
    ///
    /// Hands the job back in [`DispatchError::Full`] when the queue is at its
    /// bound, or [`DispatchError::Closed`] after shutdown.
    pub fn try_dispatch(&self, job: J) -> Result<(), DispatchError<J>> {
        let Some(sender) = &self.sender else {
            return Err(DispatchError::Closed(job));
        };
        match sender.try_send(job) {
            Ok(()) => {
                self.metrics.record_accept();
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                self.metrics.record_refused();
                Err(DispatchError::Full(job))
            }
            Err(TrySendError::Disconnected(job)) => Err(DispatchError::Closed(job)),
        }
    }

    /// Close the queue and wait for every worker to finish its current job
    ///
    /// Jobs still queued are processed before the workers exit.
    pub fn shutdown(&mut self) {
        if self.sender.take().is_none() && self.workers.is_empty() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(pool = %self.name, "Worker thread terminated abnormally");
            }
        }
        debug!(pool = %self.name, "Worker pool stopped");
    }
}

impl<J> WorkerPool<J> {
    /// Jobs waiting for a worker
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }

    /// Get metrics for this worker pool
    #[must_use]
    pub fn metrics(&self) -> &Arc<WorkerPoolMetrics> {
        &self.metrics
    }

    /// Get configuration for this worker pool
    #[must_use]
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

impl<J> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(pool = %self.name, "Worker thread terminated abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_worker_pool_metrics() {
        let metrics = WorkerPoolMetrics::new();
        assert_eq!(metrics.get_accepted_count(), 0);
        assert_eq!(metrics.get_active_count(), 0);

        metrics.record_accept();
        metrics.record_start();
        assert_eq!(metrics.get_accepted_count(), 1);
        assert_eq!(metrics.get_active_count(), 1);

        metrics.record_completion();
        assert_eq!(metrics.get_completed_count(), 1);
        assert_eq!(metrics.get_active_count(), 0);

        metrics.record_refused();
        assert_eq!(metrics.get_refused_count(), 1);
    }

    #[test]
    fn test_config_from_server_config() {
        let server = ServerConfig {
            workers: 3,
            backlog: 7,
            ..ServerConfig::default()
        };
        assert_eq!(WorkerPoolConfig::from(&server), WorkerPoolConfig::new(3, 7));
    }

    #[test]
    fn test_jobs_run_on_workers() {
        let (done_tx, done_rx) = mpsc::channel();
        let done_tx = std::sync::Mutex::new(done_tx);
        let metrics = Arc::new(WorkerPoolMetrics::new());
        let mut pool = WorkerPool::new("test", WorkerPoolConfig::new(2, 8), Arc::clone(&metrics), move |n: u32| {
            done_tx.lock().unwrap().send(n * 2).unwrap();
        })
        .unwrap();

        for n in 1..=4 {
            pool.try_dispatch(n).unwrap();
        }
        let mut results: Vec<u32> = (0..4)
            .map(|_| done_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        results.sort_unstable();
        assert_eq!(results, vec![2, 4, 6, 8]);

        pool.shutdown();
        assert_eq!(metrics.get_accepted_count(), 4);
        assert_eq!(metrics.get_completed_count(), 4);
        assert!(matches!(pool.try_dispatch(5), Err(DispatchError::Closed(5))));
    }

    #[test]
    fn test_full_queue_refuses() {
        let (release_tx, release_rx) = crossbeam::channel::unbounded::<()>();
        let (started_tx, started_rx) = crossbeam::channel::unbounded::<()>();
        let metrics = Arc::new(WorkerPoolMetrics::new());
        let pool = WorkerPool::new("full", WorkerPoolConfig::new(1, 1), Arc::clone(&metrics), move |_: u8| {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
        .unwrap();

        pool.try_dispatch(1).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.try_dispatch(2).unwrap();
        assert_eq!(pool.queue_depth(), 1);

        let refused = pool.try_dispatch(3).unwrap_err();
        assert!(matches!(refused, DispatchError::Full(_)));
        assert_eq!(refused.into_inner(), 3);
        assert_eq!(metrics.get_refused_count(), 1);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        drop(pool);
        assert_eq!(metrics.get_completed_count(), 2);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let (done_tx, done_rx) = crossbeam::channel::unbounded();
        let metrics = Arc::new(WorkerPoolMetrics::new());
        let pool = WorkerPool::new("panics", WorkerPoolConfig::new(1, 4), Arc::clone(&metrics), move |n: i32| {
            if n < 0 {
                panic!("negative job");
            }
            done_tx.send(n).unwrap();
        })
        .unwrap();

        pool.try_dispatch(-1).unwrap();
        pool.try_dispatch(7).unwrap();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        drop(pool);
        assert_eq!(metrics.get_completed_count(), 2);
    }
}
