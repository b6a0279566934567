//! Dispatch queue and worker pool
//!
//! Each named queue is a bounded channel drained by a fixed number of
//! worker tasks (one per inference accelerator). A worker owns a job from
//! the moment it receives the request until the controller returns.

use crate::controller::{JobController, JobRequest};
use crate::error::{JobError, Result};
use crate::metrics;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-job cancellation tokens, shared by the queue and the service
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: DashMap<String, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `job_id`, created on first use
    pub fn token(&self, job_id: &str) -> CancellationToken {
        self.tokens
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    /// Signal the job to stop at its next checkpoint; returns whether it was tracked.
    ///
    /// The cancelled token stays registered until the worker forgets it, so a
    /// job deleted while still queued is seen as cancelled when dequeued.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.tokens.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn forget(&self, job_id: &str) {
        self.tokens.remove(job_id);
    }

    pub fn cancel_all(&self) {
        for entry in self.tokens.iter() {
            entry.value().cancel();
        }
        self.tokens.clear();
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

struct NamedQueue {
    sender: mpsc::Sender<JobRequest>,
    receiver: Arc<Mutex<mpsc::Receiver<JobRequest>>>,
    workers: Vec<JoinHandle<()>>,
    controller: JobController,
}

pub struct JobQueue {
    queues: HashMap<String, NamedQueue>,
    registry: Arc<CancellationRegistry>,
    shutdown: CancellationToken,
}

impl JobQueue {
    pub fn new(registry: Arc<CancellationRegistry>) -> Self {
        Self {
            queues: HashMap::new(),
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start `worker_count` workers draining the queue called `name`
    pub fn spawn_queue(
        &mut self,
        name: &str,
        worker_count: usize,
        capacity: usize,
        controller: JobController,
    ) {
        let (sender, receiver) = mpsc::channel::<JobRequest>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    name.to_string(),
                    worker,
                    receiver.clone(),
                    controller.clone(),
                    self.registry.clone(),
                    self.shutdown.clone(),
                ))
            })
            .collect();

        info!(queue = %name, workers = worker_count.max(1), capacity = capacity, "Queue started");
        self.queues.insert(
            name.to_string(),
            NamedQueue {
                sender,
                receiver,
                workers,
                controller,
            },
        );
    }

    /// Hand `request` to a worker of `target_queue`
    pub async fn enqueue(&self, request: JobRequest, target_queue: &str) -> Result<()> {
        let queue = self
            .queues
            .get(target_queue)
            .ok_or_else(|| JobError::QueueUnavailable(format!("no queue named {}", target_queue)))?;

        let job_id = request.job_id.clone();
        // register first so a delete issued while the job waits still reaches it
        self.registry.token(&job_id);
        if let Err(e) = queue.sender.send(request).await {
            self.registry.forget(&job_id);
            return Err(JobError::QueueUnavailable(format!("{}: {}", target_queue, e)));
        }

        metrics::QUEUE_DEPTH.inc();
        debug!(job_id = %job_id, queue = %target_queue, "Job enqueued");
        Ok(())
    }

    /// Stop accepting work, cancel in-flight jobs and wait for workers to exit.
    ///
    /// Requests still waiting in a channel never start; their queued records
    /// are removed so pollers see the job as gone rather than stuck.
    pub async fn shutdown(self) -> usize {
        self.shutdown.cancel();
        info!(in_flight = self.registry.len(), "Cancelling tracked jobs");
        self.registry.cancel_all();

        let mut abandoned = 0;
        for (name, queue) in self.queues {
            drop(queue.sender);
            for handle in queue.workers {
                if let Err(e) = handle.await {
                    warn!(queue = %name, error = %e, "Worker ended abnormally");
                }
            }

            let mut rx = queue.receiver.lock().await;
            rx.close();
            while let Ok(request) = rx.try_recv() {
                metrics::QUEUE_DEPTH.dec();
                let reason = JobError::Cancelled(format!("{} dropped at shutdown", request.job_id));
                queue.controller.record_failure(&request.job_id, &reason);
                abandoned += 1;
            }
        }
        info!(abandoned = abandoned, "Dispatch queues stopped");
        abandoned
    }
}

async fn worker_loop(
    queue: String,
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<JobRequest>>>,
    controller: JobController,
    registry: Arc<CancellationRegistry>,
    shutdown: CancellationToken,
) {
    debug!(queue = %queue, worker = worker, "Worker started");
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                request = rx.recv() => request,
            }
        };
        let Some(request) = next else {
            break;
        };
        metrics::QUEUE_DEPTH.dec();

        let job_id = request.job_id.clone();
        let token = registry.token(&job_id);
        if token.is_cancelled() {
            debug!(job_id = %job_id, "Job was cancelled while queued");
        }
        let outcome = controller.run(request, token).await;
        registry.forget(&job_id);
        debug!(queue = %queue, worker = worker, job_id = %job_id, ok = outcome.is_ok(), "Worker finished job");
    }
    debug!(queue = %queue, worker = worker, "Worker stopped");
}
