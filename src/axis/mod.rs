//! Axis -- fault-tolerant job scheduling.
//!
//! Persistent queue, worker pool, boot-time recovery, per-gear circuit
//! breaker, loop watchdog, and the cron schedule evaluator. Circuit and
//! watchdog state are values owned here and handed to workers, not global
//! singletons, so tests stay hermetic.

pub mod breaker;
pub mod queue;
pub mod recovery;
pub mod schedule;
pub mod watchdog;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::MeridianConfig;
use crate::store::{Store, StoreError};

use breaker::CircuitBreaker;
use queue::JobQueue;
use recovery::RecoverySummary;
use schedule::ScheduleEvaluator;
use watchdog::{SchedulerGauges, Watchdog};
use worker::{JobRunner, WorkerPool};

/// The assembled scheduler: queue, breaker, watchdog, evaluator, workers.
pub struct Axis {
    queue: JobQueue,
    breaker: Arc<CircuitBreaker>,
    watchdog: Arc<Watchdog>,
    evaluator: ScheduleEvaluator,
    workers: usize,
    heartbeat_interval: Duration,
}

impl Axis {
    /// Assemble the scheduler from configuration. No tasks run yet.
    pub fn new(config: &MeridianConfig, store: Store) -> Self {
        let queue = JobQueue::new(store.clone());
        let evaluator = ScheduleEvaluator::new(
            store,
            queue.clone(),
            Duration::from_millis(config.schedule_evaluator.interval_ms),
        );
        Self {
            queue,
            breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            watchdog: Arc::new(Watchdog::new(config.watchdog.clone())),
            evaluator,
            workers: config.runtime.workers,
            heartbeat_interval: Duration::from_millis(config.runtime.heartbeat_interval_ms),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    pub fn evaluator(&self) -> &ScheduleEvaluator {
        &self.evaluator
    }

    /// Boot-time recovery. Must run before [`Axis::start`].
    pub async fn recover(&self) -> Result<RecoverySummary, StoreError> {
        recovery::recover(self.queue.store()).await
    }

    /// Start workers, the schedule evaluator, and the watchdog.
    pub fn start(
        &self,
        runner: Arc<dyn JobRunner>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let pool = WorkerPool::new(
            self.queue.clone(),
            runner,
            self.workers,
            self.heartbeat_interval,
        );

        // Queue depth is sampled by a side task; the gauge closure itself
        // must stay synchronous.
        let depth = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let depth_writer = Arc::clone(&depth);
        let depth_queue = self.queue.clone();
        let mut depth_shutdown = shutdown.clone();
        let depth_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        if let Ok(count) = pending_count(&depth_queue).await {
                            depth_writer.store(count, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                    changed = depth_shutdown.changed() => {
                        if changed.is_err() || *depth_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        let active = pool.active_count();
        self.watchdog.start(Arc::new(move || SchedulerGauges {
            active_workers: active.load(std::sync::atomic::Ordering::Relaxed),
            queued_jobs: depth.load(std::sync::atomic::Ordering::Relaxed),
        }));

        let mut handles = pool.spawn(shutdown.clone());
        handles.push(depth_task);

        let evaluator = self.evaluator.clone();
        let eval_shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            evaluator.run(eval_shutdown).await;
        }));

        handles
    }

    /// Stop the watchdog (workers and evaluator stop via the shutdown
    /// channel).
    pub fn stop(&self) {
        self.watchdog.stop();
    }
}

/// Jobs currently waiting for a worker.
async fn pending_count(queue: &JobQueue) -> Result<usize, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM jobs WHERE status = 'pending'")
        .fetch_one(queue.store().reader())
        .await?;
    Ok(usize::try_from(count).unwrap_or(0))
}
