//! Concurrent batch execution
//!
//! Runs a list of jobs through a bounded pool of workers pulling from a
//! shared queue, collects exactly one result per executed job, and supports
//! cooperative abort: workers observe the abort flag between jobs and
//! in-flight work is allowed to finish within a grace period rather than
//! being killed mid-write.

pub mod sizing;

pub use sizing::{compute as compute_batch_plan, BatchPlan, SizingInputs};

use anyhow::Result;
use async_trait::async_trait;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::models::{BatchJob, BatchResult, ResourceKind, RunState, UtilizationTier};
use crate::monitor::ResourceMonitor;
use crate::observability::EngineMetrics;

/// How long workers still executing a job are awaited after an abort.
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Pause between backpressure checks while the host is critical.
const PRESSURE_BACKOFF: Duration = Duration::from_millis(500);

/// Batch-level progress callback: `(source identifier, fraction in [0, 1])`.
pub type ProgressFn = Arc<dyn Fn(&str, f32) + Send + Sync>;

/// Callback invoked for each result as it is produced.
pub type ResultFn = Arc<dyn Fn(&BatchResult) + Send + Sync>;

/// Per-job progress reporter handed to the executor.
pub type JobProgress = Arc<dyn Fn(f32) + Send + Sync>;

/// Collaborator that performs the actual work of one job (the transcode
/// subprocess call). Must be safe to call concurrently with different
/// jobs and must not mutate state shared across jobs.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Execute one job, reporting fractional progress through `progress`.
    /// An error is captured into the job's `BatchResult`; it never stops
    /// other workers.
    async fn execute(&self, job: &BatchJob, progress: JobProgress) -> Result<()>;
}

/// Executes batches of jobs with bounded concurrency. One batch at a time
/// per instance.
pub struct BatchProcessor {
    executor: Arc<dyn JobExecutor>,
    monitor: Option<Arc<ResourceMonitor>>,
    state: Arc<Mutex<RunState>>,
    abort: Arc<AtomicBool>,
    metrics: EngineMetrics,
}

impl BatchProcessor {
    pub fn new(executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            executor,
            monitor: None,
            state: Arc::new(Mutex::new(RunState::Idle)),
            abort: Arc::new(AtomicBool::new(false)),
            metrics: EngineMetrics::new(),
        }
    }

    /// Attach a monitor for backpressure: workers pause between jobs while
    /// host memory or compute is critical.
    pub fn with_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn run_state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: RunState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Request cooperative abort of the running batch. Returns false when
    /// no batch is running. Idempotent: repeated calls keep returning true
    /// until the batch finishes draining.
    pub fn request_abort(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            RunState::Idle => false,
            RunState::Running => {
                info!("Batch abort requested");
                *state = RunState::AbortRequested;
                self.abort.store(true, Ordering::SeqCst);
                true
            }
            RunState::AbortRequested | RunState::Draining => true,
        }
    }

    /// Execute all jobs with up to `worker_count` concurrent workers.
    ///
    /// Returns one `BatchResult` per executed job; result order does not
    /// match submission order, correlate via `BatchResult::source`. Fails
    /// with `AlreadyRunning` if a batch is in flight.
    pub async fn process_batch(
        &self,
        jobs: Vec<BatchJob>,
        worker_count: usize,
        progress_fn: Option<ProgressFn>,
        result_fn: Option<ResultFn>,
    ) -> Result<Vec<BatchResult>, EngineError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != RunState::Idle {
                return Err(EngineError::AlreadyRunning);
            }
            // Reset under the same lock that publishes Running: an abort
            // acknowledged against Running must never be erased afterwards.
            self.abort.store(false, Ordering::SeqCst);
            *state = RunState::Running;
        }

        let job_count = jobs.len();
        if job_count == 0 {
            self.set_state(RunState::Idle);
            return Ok(Vec::new());
        }

        let workers = worker_count.min(job_count).max(1);
        info!(job_count, workers, "Starting batch");

        // Fresh queue per batch: no residual work can leak in from a
        // previous run. The sender is dropped once everything is enqueued
        // so an empty queue reads as closed.
        let (job_tx, job_rx) = mpsc::channel(job_count);
        for job in jobs {
            // Capacity equals the job count; this send never blocks.
            let _ = job_tx.send(job).await;
        }
        drop(job_tx);
        let queue = Arc::new(tokio::sync::Mutex::new(job_rx));

        let (result_tx, mut result_rx) = mpsc::channel::<BatchResult>(job_count);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let context = WorkerContext {
                worker_id,
                executor: Arc::clone(&self.executor),
                monitor: self.monitor.clone(),
                abort: Arc::clone(&self.abort),
                queue: Arc::clone(&queue),
                results: result_tx.clone(),
                progress_fn: progress_fn.clone(),
            };
            handles.push(tokio::spawn(context.run()));
        }
        drop(result_tx);

        // Collect in a task of its own so worker joins below can be
        // bounded without losing results already produced.
        let metrics = self.metrics.clone();
        let collector = tokio::spawn(async move {
            let mut results = Vec::with_capacity(job_count);
            while let Some(result) = result_rx.recv().await {
                metrics.observe_job(result.success, result.duration_secs);
                // A panicking result callback is logged and skipped; it must
                // never cost the batch its results.
                if let Some(callback) = &result_fn {
                    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&result))).is_err() {
                        warn!(source = %result.source, "Result callback panicked, continuing");
                    }
                }
                results.push(result);
            }
            results
        });

        for mut handle in handles {
            if self.abort.load(Ordering::SeqCst) {
                // Grace period for in-flight jobs; a worker stuck past it
                // is aborted so its result sender drops and the collector
                // can finish. Its job produces no result.
                if tokio::time::timeout(ABORT_GRACE, &mut handle).await.is_err() {
                    warn!("Worker did not finish within abort grace period, aborting it");
                    handle.abort();
                }
            } else {
                let _ = handle.await;
            }
        }

        if self.abort.load(Ordering::SeqCst) {
            self.set_state(RunState::Draining);
        }

        let results = collector.await.unwrap_or_default();
        info!(
            results = results.len(),
            failed = results.iter().filter(|r| !r.success).count(),
            aborted = self.abort.load(Ordering::SeqCst),
            "Batch finished"
        );

        self.set_state(RunState::Idle);
        Ok(results)
    }
}

struct WorkerContext {
    worker_id: usize,
    executor: Arc<dyn JobExecutor>,
    monitor: Option<Arc<ResourceMonitor>>,
    abort: Arc<AtomicBool>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<BatchJob>>>,
    results: mpsc::Sender<BatchResult>,
    progress_fn: Option<ProgressFn>,
}

impl WorkerContext {
    async fn run(self) {
        loop {
            // Abort is observed only between jobs, never mid-job.
            if self.abort.load(Ordering::SeqCst) {
                debug!(worker_id = self.worker_id, "Abort observed, worker exiting");
                break;
            }

            if let Some(monitor) = &self.monitor {
                self.wait_for_headroom(monitor).await;
                if self.abort.load(Ordering::SeqCst) {
                    break;
                }
            }

            // The queue sender is already dropped, so recv returns a job
            // immediately or `None` once the queue is empty. The lock is
            // held only for the pull, never during execution.
            let job = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some(job) = job else {
                debug!(worker_id = self.worker_id, "Queue empty, worker exiting");
                break;
            };

            let result = self.execute_one(job).await;
            if self.results.send(result).await.is_err() {
                break;
            }
        }
    }

    async fn execute_one(&self, job: BatchJob) -> BatchResult {
        let source = job.source_id();
        debug!(worker_id = self.worker_id, source = %source, "Job started");

        let progress: JobProgress = {
            let progress_fn = self.progress_fn.clone();
            let source = source.clone();
            Arc::new(move |fraction: f32| {
                let Some(callback) = &progress_fn else {
                    return;
                };
                let fraction = fraction.clamp(0.0, 1.0);
                // Isolated like the result callback: a panicking observer
                // must not take the worker (and its job's result) with it.
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&source, fraction)))
                    .is_err()
                {
                    warn!(source = %source, "Progress callback panicked, continuing");
                }
            })
        };

        let start = Instant::now();
        match self.executor.execute(&job, progress).await {
            Ok(()) => BatchResult {
                source,
                success: true,
                duration_secs: start.elapsed().as_secs_f64(),
                error_message: None,
            },
            Err(e) => {
                warn!(
                    worker_id = self.worker_id,
                    source = %source,
                    error = %e,
                    "Job failed"
                );
                BatchResult {
                    source,
                    success: false,
                    duration_secs: start.elapsed().as_secs_f64(),
                    error_message: Some(e.to_string()),
                }
            }
        }
    }

    /// Backpressure: hold off dispatching the next job while host memory
    /// or compute sits in the critical tier.
    async fn wait_for_headroom(&self, monitor: &ResourceMonitor) {
        loop {
            if self.abort.load(Ordering::SeqCst) {
                return;
            }
            let critical = [ResourceKind::Memory, ResourceKind::Compute]
                .into_iter()
                .any(|kind| {
                    monitor
                        .sample(kind)
                        .map(|sample| sample.tier == UtilizationTier::Critical)
                        .unwrap_or(false)
                });
            if !critical {
                return;
            }
            debug!(
                worker_id = self.worker_id,
                "Host under critical pressure, delaying next job"
            );
            tokio::time::sleep(PRESSURE_BACKOFF).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Executor that records invocations and can fail or stall on demand.
    struct MockExecutor {
        delay: Duration,
        fail_sources: HashSet<String>,
        started: AtomicUsize,
        first_started: Notify,
    }

    impl MockExecutor {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                fail_sources: HashSet::new(),
                started: AtomicUsize::new(0),
                first_started: Notify::new(),
            }
        }

        fn failing(mut self, sources: &[&str]) -> Self {
            self.fail_sources = sources.iter().map(|s| s.to_string()).collect();
            self
        }
    }

    #[async_trait]
    impl JobExecutor for MockExecutor {
        async fn execute(&self, job: &BatchJob, progress: JobProgress) -> Result<()> {
            if self.started.fetch_add(1, Ordering::SeqCst) == 0 {
                self.first_started.notify_waiters();
            }
            progress(0.0);
            tokio::time::sleep(self.delay).await;
            progress(1.0);
            if self.fail_sources.contains(&job.source_id()) {
                return Err(anyhow!("synthetic transcode failure"));
            }
            Ok(())
        }
    }

    /// Executor that starts a job and never finishes it.
    struct StallingExecutor {
        started: Notify,
    }

    #[async_trait]
    impl JobExecutor for StallingExecutor {
        async fn execute(&self, _job: &BatchJob, _progress: JobProgress) -> Result<()> {
            self.started.notify_waiters();
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn jobs(count: usize) -> Vec<BatchJob> {
        (0..count)
            .map(|i| BatchJob::new(format!("/media/in{i}.mkv"), format!("/media/out{i}.mp4")))
            .collect()
    }

    #[tokio::test]
    async fn test_every_job_yields_exactly_one_result() {
        let executor = Arc::new(MockExecutor::new(Duration::from_millis(2)));
        let processor = BatchProcessor::new(executor);

        let results = processor
            .process_batch(jobs(10), 3, None, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 10);
        let sources: HashSet<_> = results.iter().map(|r| r.source.clone()).collect();
        assert_eq!(sources.len(), 10, "duplicate or missing source identifiers");
        assert!(results.iter().all(|r| r.success));
        assert_eq!(processor.run_state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_failed_jobs_are_captured_not_propagated() {
        let executor = Arc::new(
            MockExecutor::new(Duration::from_millis(1)).failing(&["/media/in2.mkv"]),
        );
        let processor = BatchProcessor::new(executor);

        let results = processor
            .process_batch(jobs(5), 2, None, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].source, "/media/in2.mkv");
        assert!(failed[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("synthetic"));
    }

    #[tokio::test]
    async fn test_abort_when_idle_returns_false() {
        let executor = Arc::new(MockExecutor::new(Duration::from_millis(1)));
        let processor = BatchProcessor::new(executor);

        assert!(!processor.request_abort());
        assert_eq!(processor.run_state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_abort_skips_jobs_never_dequeued() {
        let executor = Arc::new(MockExecutor::new(Duration::from_millis(50)));
        let processor = Arc::new(BatchProcessor::new(executor.clone()));

        let runner = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.process_batch(jobs(6), 1, None, None).await })
        };

        // Wait for the single worker to take the first job, then abort.
        executor.first_started.notified().await;
        assert!(processor.request_abort());
        // Repeated abort stays true while running.
        assert!(processor.request_abort());

        let results = runner.await.unwrap().unwrap();

        // The in-flight job finished; the five never-dequeued jobs
        // produced no results.
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(processor.run_state(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_worker_is_abandoned_after_grace() {
        let executor = Arc::new(StallingExecutor {
            started: Notify::new(),
        });
        let processor = Arc::new(BatchProcessor::new(executor.clone()));

        let runner = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.process_batch(jobs(1), 1, None, None).await })
        };

        executor.started.notified().await;
        assert!(processor.request_abort());

        // The batch must come back once the grace period elapses even
        // though the worker never finishes its job.
        let results = tokio::time::timeout(ABORT_GRACE * 4, runner)
            .await
            .expect("process_batch did not return after the abort grace period")
            .unwrap()
            .unwrap();

        assert!(results.is_empty());
        assert_eq!(processor.run_state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_panicking_result_callback_is_isolated() {
        let executor = Arc::new(MockExecutor::new(Duration::from_millis(1)));
        let processor = BatchProcessor::new(executor);

        let results_cb: ResultFn = Arc::new(|_result: &BatchResult| {
            panic!("observer bug");
        });

        let results = processor
            .process_batch(jobs(5), 2, None, Some(results_cb))
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_panicking_progress_callback_is_isolated() {
        let executor = Arc::new(MockExecutor::new(Duration::from_millis(1)));
        let processor = BatchProcessor::new(executor);

        let progress: ProgressFn = Arc::new(|_source: &str, _fraction: f32| {
            panic!("observer bug");
        });

        let results = processor
            .process_batch(jobs(3), 2, Some(progress), None)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_abort_does_not_leak_into_next_batch() {
        let executor = Arc::new(MockExecutor::new(Duration::from_millis(20)));
        let processor = Arc::new(BatchProcessor::new(executor.clone()));

        let runner = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.process_batch(jobs(4), 1, None, None).await })
        };
        executor.first_started.notified().await;
        assert!(processor.request_abort());
        let aborted = runner.await.unwrap().unwrap();
        assert!(aborted.len() < 4);
        assert_eq!(processor.run_state(), RunState::Idle);

        // The next batch starts with a cleared abort flag and runs through.
        let results = processor
            .process_batch(jobs(4), 2, None, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
    }

    #[tokio::test]
    async fn test_reentrancy_is_rejected() {
        let executor = Arc::new(MockExecutor::new(Duration::from_millis(50)));
        let processor = Arc::new(BatchProcessor::new(executor.clone()));

        let runner = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.process_batch(jobs(2), 1, None, None).await })
        };

        executor.first_started.notified().await;
        let second = processor.process_batch(jobs(1), 1, None, None).await;
        assert!(matches!(second, Err(EngineError::AlreadyRunning)));

        let results = runner.await.unwrap().unwrap();
        assert_eq!(results.len(), 2);

        // Idle again: a new batch is accepted.
        let results = processor
            .process_batch(jobs(1), 1, None, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_returns_immediately() {
        let executor = Arc::new(MockExecutor::new(Duration::from_millis(1)));
        let processor = BatchProcessor::new(executor);

        let results = processor
            .process_batch(Vec::new(), 4, None, None)
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(processor.run_state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_worker_count_capped_by_job_count() {
        let executor = Arc::new(MockExecutor::new(Duration::from_millis(1)));
        let processor = BatchProcessor::new(executor.clone());

        let results = processor
            .process_batch(jobs(2), 16, None, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(executor.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_progress_and_result_callbacks() {
        let executor = Arc::new(MockExecutor::new(Duration::from_millis(1)));
        let processor = BatchProcessor::new(executor);

        let progress_events = Arc::new(Mutex::new(Vec::new()));
        let progress: ProgressFn = {
            let events = Arc::clone(&progress_events);
            Arc::new(move |source: &str, fraction: f32| {
                events.lock().unwrap().push((source.to_string(), fraction));
            })
        };

        let result_count = Arc::new(AtomicUsize::new(0));
        let results_cb: ResultFn = {
            let count = Arc::clone(&result_count);
            Arc::new(move |_result: &BatchResult| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        let results = processor
            .process_batch(jobs(3), 2, Some(progress), Some(results_cb))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(result_count.load(Ordering::SeqCst), 3);

        let events = progress_events.lock().unwrap();
        // Each job reports at least start and completion.
        assert!(events.len() >= 6);
        assert!(events.iter().any(|(_, f)| *f == 1.0));
    }

    #[tokio::test]
    async fn test_results_carry_duration() {
        let executor = Arc::new(MockExecutor::new(Duration::from_millis(20)));
        let processor = BatchProcessor::new(executor);

        let results = processor
            .process_batch(jobs(1), 1, None, None)
            .await
            .unwrap();

        assert!(results[0].duration_secs >= 0.015);
    }
}
