//! Bounded worker pool.
//!
//! Submissions go into a bounded queue drained by a single dispatcher
//! task, which runs at most `max_workers` jobs at a time. Capacity is
//! reserved before the `Queued` record is written, so a rejected
//! submission never leaves a record behind.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshgen_core::error::CoreError;
use meshgen_core::job::{JobRequest, JobStatus};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::status_table::StatusTable;
use crate::worker::GenerationWorker;

/// Status message for jobs cut off by shutdown.
const MSG_SHUTTING_DOWN: &str = "Failed to generate model: service shutting down";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of jobs running at once.
    pub max_workers: usize,
    /// Maximum number of accepted jobs waiting for a worker.
    pub queue_capacity: usize,
    /// How long shutdown waits for running jobs before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            queue_capacity: 64,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Generation queue is full, try again later")]
    QueueFull,

    #[error("Generation service is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Status(#[from] CoreError),
}

impl From<PoolError> for CoreError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Status(inner) => inner,
            other => CoreError::ServiceUnavailable(other.to_string()),
        }
    }
}

/// Handle to the running pool. Cheap to share behind an `Arc`.
pub struct WorkerPool {
    tx: mpsc::Sender<JobRequest>,
    table: Arc<StatusTable>,
    cancel: CancellationToken,
    dispatcher: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the dispatcher task.
    pub fn start(worker: Arc<GenerationWorker>, config: PoolConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let table = Arc::clone(worker.table());
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher {
            rx,
            worker,
            slots: Arc::new(Semaphore::new(config.max_workers.max(1))),
            shutdown_grace: config.shutdown_grace,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(dispatcher.run());

        Self {
            tx,
            table,
            cancel,
            dispatcher: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    /// Accept a job: reserve a queue slot, record it as `Queued`, enqueue it.
    pub async fn submit(&self, job: JobRequest) -> Result<JobStatus, PoolError> {
        let permit = self.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => PoolError::QueueFull,
            mpsc::error::TrySendError::Closed(()) => PoolError::ShuttingDown,
        })?;
        let status = self.table.insert_queued(&job.id).await?;
        tracing::info!(request_id = %job.id, "Generation request queued");
        permit.send(job);
        Ok(status)
    }

    /// Stop accepting work, fail queued jobs, and wait for running ones.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down worker pool");
        self.cancel.cancel();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Dispatcher task failed");
            }
        }
        tracing::info!("Worker pool shut down complete");
    }
}

struct Dispatcher {
    rx: mpsc::Receiver<JobRequest>,
    worker: Arc<GenerationWorker>,
    slots: Arc<Semaphore>,
    shutdown_grace: Duration,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut running = JoinSet::new();
        let in_flight: Arc<Mutex<HashSet<String>>> = Arc::default();
        tracing::info!(max_workers = self.slots.available_permits(), "Job dispatcher started");

        loop {
            let slot = tokio::select! {
                _ = self.cancel.cancelled() => break,
                slot = Arc::clone(&self.slots).acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };
            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            tracing::debug!(request_id = %job.id, "Dispatching job to worker");
            lock(&in_flight).insert(job.id.clone());
            let worker = Arc::clone(&self.worker);
            let in_flight = Arc::clone(&in_flight);
            running.spawn(async move {
                let request_id = job.id.clone();
                worker.run(job).await;
                lock(&in_flight).remove(&request_id);
                drop(slot);
            });

            while let Some(result) = running.try_join_next() {
                log_join(result);
            }
        }

        tracing::info!("Job dispatcher shutting down");
        self.drain_queue().await;

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(result) = running.join_next().await {
                log_join(result);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(running = running.len(), "Aborting jobs still running after grace period");
            running.shutdown().await;
            let aborted: Vec<String> = lock(&in_flight).drain().collect();
            for request_id in aborted {
                if let Err(e) = self.worker.table().fail(&request_id, MSG_SHUTTING_DOWN).await {
                    tracing::error!(request_id = %request_id, error = %e, "Failed to record abort");
                }
            }
        }
    }

    /// Record every job still waiting in the queue as failed.
    async fn drain_queue(&mut self) {
        self.rx.close();
        while let Some(job) = self.rx.recv().await {
            tracing::warn!(request_id = %job.id, "Dropping queued job on shutdown");
            if let Err(e) = self.worker.table().fail(&job.id, MSG_SHUTTING_DOWN).await {
                tracing::error!(request_id = %job.id, error = %e, "Failed to record shutdown");
            }
        }
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            tracing::error!(error = %e, "Worker task failed");
        }
    }
}
