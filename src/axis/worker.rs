//! Worker pool.
//!
//! A fixed set of workers polls the queue; each holds at most one job and
//! drives it through the pipeline via the [`JobRunner`] boundary. While a
//! job runs, a heartbeat task refreshes the worker's lease so recovery can
//! tell live owners from stale ones.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::types::Job;

use super::queue::JobQueue;

/// Poll delay when the queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Boundary the pool drives jobs through. Implemented by the pipeline
/// orchestrator; workers never see the orchestrator type itself.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run one claimed job to a terminal or parked state. Must not panic;
    /// any error is absorbed into the job's own status.
    async fn run_job(&self, job: Job, worker_id: &str);
}

/// Fixed worker pool over the shared queue.
pub struct WorkerPool {
    queue: JobQueue,
    runner: Arc<dyn JobRunner>,
    workers: usize,
    heartbeat_interval: Duration,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        runner: Arc<dyn JobRunner>,
        workers: usize,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            queue,
            runner,
            workers: workers.max(1),
            heartbeat_interval,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Workers currently holding a job (watchdog gauge).
    pub fn active_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active)
    }

    /// Spawn the pool; returns the worker join handles.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|i| {
                let worker_id = format!("worker-{i}");
                let queue = self.queue.clone();
                let runner = Arc::clone(&self.runner);
                let active = Arc::clone(&self.active);
                let heartbeat_interval = self.heartbeat_interval;
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_worker(
                        worker_id,
                        queue,
                        runner,
                        active,
                        heartbeat_interval,
                        shutdown,
                    )
                    .await;
                })
            })
            .collect()
    }
}

async fn run_worker(
    worker_id: String,
    queue: JobQueue,
    runner: Arc<dyn JobRunner>,
    active: Arc<AtomicUsize>,
    heartbeat_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(worker = %worker_id, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = match queue.claim_next(&worker_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(worker = %worker_id, error = %e, "claim failed");
                None
            }
        };

        let Some(job) = claimed else {
            tokio::select! {
                _ = tokio::time::sleep(IDLE_POLL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        tracing::info!(worker = %worker_id, job_id = %job.id, "job claimed");
        active.fetch_add(1, Ordering::Relaxed);

        let heartbeat = spawn_heartbeat(
            queue.clone(),
            job.id,
            worker_id.clone(),
            heartbeat_interval,
        );
        runner.run_job(job, &worker_id).await;
        heartbeat.abort();

        active.fetch_sub(1, Ordering::Relaxed);
    }
    tracing::info!(worker = %worker_id, "worker stopped");
}

/// Refresh the lease until aborted. A lost lease stops the task; the job
/// now belongs to recovery or cancellation.
fn spawn_heartbeat(
    queue: JobQueue,
    job_id: uuid::Uuid,
    worker_id: String,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match queue.heartbeat(job_id, &worker_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(%job_id, worker = %worker_id, "lease lost; heartbeat stopping");
                    return;
                }
                Err(e) => {
                    tracing::warn!(%job_id, worker = %worker_id, error = %e, "heartbeat failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::queue::NewJob;
    use crate::store::Store;
    use crate::types::JobStatus;
    use std::sync::Mutex;

    /// Runner that records job ids and completes them.
    struct RecordingRunner {
        queue: JobQueue,
        seen: Mutex<Vec<uuid::Uuid>>,
    }

    #[async_trait]
    impl JobRunner for RecordingRunner {
        async fn run_job(&self, job: Job, worker_id: &str) {
            self.seen.lock().expect("test lock").push(job.id);
            self.queue
                .transition(
                    job.id,
                    JobStatus::Planning,
                    JobStatus::Completed,
                    Some(worker_id),
                )
                .await
                .expect("transition");
        }
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_shuts_down() {
        let store = Store::open_in_memory().await.expect("open");
        let queue = JobQueue::new(store);

        let mut created = Vec::new();
        for i in 0..3 {
            let job = queue
                .create_job(NewJob::user_request(format!("job {i}")))
                .await
                .expect("create");
            created.push(job.id);
        }

        let runner = Arc::new(RecordingRunner {
            queue: queue.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let pool = WorkerPool::new(
            queue.clone(),
            Arc::clone(&runner) as Arc<dyn JobRunner>,
            2,
            Duration::from_secs(5),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = pool.spawn(shutdown_rx);

        // Wait for all jobs to reach a terminal state.
        for _ in 0..100 {
            let mut done = 0;
            for id in &created {
                let job = queue.get_job(*id).await.expect("get").expect("present");
                if job.status.is_terminal() {
                    done = done.saturating_add(1);
                }
            }
            if done == created.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let seen = runner.seen.lock().expect("test lock").clone();
        assert_eq!(seen.len(), 3, "every job ran exactly once");

        shutdown_tx.send(true).expect("send");
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
        assert_eq!(pool.active.load(Ordering::Relaxed), 0);
    }
}
