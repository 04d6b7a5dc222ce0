//! Worker implementation for processing jobs.

use crate::error::{QueueError, QueueResult};
use crate::failed::FailedJobRecorder;
use crate::job::{JobRecord, MAX_BACKOFF};
use crate::pending::PendingJob;
use crate::queue::Queue;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Job handler function type.
pub type JobHandler =
    Arc<dyn Fn(JobRecord) -> Pin<Box<dyn Future<Output = QueueResult<()>> + Send>> + Send + Sync>;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of jobs processed at once
    pub concurrency: usize,

    /// How long one dequeue waits on an empty queue
    pub block_timeout: Duration,

    /// Pause after a store fault before polling again
    pub error_backoff: Duration,

    /// Upper bound on the retry backoff
    pub max_backoff: Duration,

    /// Margin kept between the handler deadline and the visibility deadline
    pub job_timeout_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            block_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            max_backoff: MAX_BACKOFF,
            job_timeout_grace: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Take settings that belong to the queue from `queue`.
    pub fn for_queue(queue: &Queue) -> Self {
        Self {
            block_timeout: queue.config().block_timeout,
            ..Self::default()
        }
    }

    /// Set the number of concurrent jobs.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set how long a dequeue blocks on an empty queue.
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Set the pause after a store fault.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Set the retry backoff cap.
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the margin before the visibility deadline.
    pub fn with_job_timeout_grace(mut self, grace: Duration) -> Self {
        self.job_timeout_grace = grace;
        self
    }
}

/// How a processed job was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded and the job was acknowledged
    Completed,
    /// Handler failed and the job was reposted
    Retrying {
        /// Delay before the next delivery
        after: Duration,
    },
    /// The job used up its attempts and was recorded as failed
    Failed,
}

/// State shared by every worker task.
struct Executor {
    queue: Queue,
    handlers: RwLock<HashMap<String, JobHandler>>,
    recorder: RwLock<Arc<dyn FailedJobRecorder>>,
    config: WorkerConfig,
}

impl Executor {
    async fn run_once(&self) -> QueueResult<Option<JobOutcome>> {
        let Some(pending) = self.queue.dequeue(Some(self.config.block_timeout)).await? else {
            return Ok(None);
        };
        self.process(pending).await.map(Some)
    }

    /// Time the handler gets: the running timeout less the grace margin.
    fn execution_limit(&self, running_timeout: Duration) -> Duration {
        match running_timeout.checked_sub(self.config.job_timeout_grace) {
            Some(limit) if !limit.is_zero() => limit,
            _ => running_timeout,
        }
    }

    async fn execute(&self, record: &JobRecord, limit: Duration) -> QueueResult<()> {
        let handler = self.handlers.read().get(&record.name).cloned();
        let Some(handler) = handler else {
            return Err(QueueError::NoHandler(record.name.clone()));
        };

        // Spawned so a panicking handler fails the job instead of the worker.
        let mut task = tokio::spawn(handler(record.clone()));
        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(QueueError::ExecutionFailed(format!(
                "handler panicked: {}",
                join_error
            ))),
            Err(_) => {
                task.abort();
                Err(QueueError::Timeout)
            }
        }
    }

    async fn process(&self, pending: PendingJob) -> QueueResult<JobOutcome> {
        let record = pending.job().clone();
        let limit = self.execution_limit(pending.running_timeout());

        debug!(
            queue = %self.queue.name(),
            job_id = %record.id,
            job = %record.name,
            attempts = record.attempts,
            "Processing job"
        );

        // Expired reservations count as attempts, so a job that keeps taking
        // its worker down arrives here with its attempts already used up.
        if record.attempts >= record.max_attempts {
            let error = QueueError::AttemptsExceeded {
                attempts: record.attempts,
                max_attempts: record.max_attempts,
            };
            warn!(
                queue = %self.queue.name(),
                job_id = %record.id,
                job = %record.name,
                attempts = record.attempts,
                "Job exceeded its attempt limit; not running it"
            );
            let recorder = self.recorder.read().clone();
            pending.fail(error.to_string(), recorder.as_ref()).await?;
            return Ok(JobOutcome::Failed);
        }

        let error = match self.execute(&record, limit).await {
            Ok(()) => {
                if !pending.ack().await? {
                    warn!(
                        queue = %self.queue.name(),
                        job_id = %record.id,
                        "Job finished after its reservation lapsed; it may run again"
                    );
                }
                debug!(queue = %self.queue.name(), job_id = %record.id, "Job completed");
                return Ok(JobOutcome::Completed);
            }
            Err(e) => e,
        };

        if pending.is_last_attempt() {
            warn!(
                queue = %self.queue.name(),
                job_id = %record.id,
                job = %record.name,
                error = %error,
                "Job failed on its last attempt"
            );
            let recorder = self.recorder.read().clone();
            pending.fail(error.to_string(), recorder.as_ref()).await?;
            return Ok(JobOutcome::Failed);
        }

        let after = record.retry_backoff(self.config.max_backoff);
        warn!(
            queue = %self.queue.name(),
            job_id = %record.id,
            job = %record.name,
            error = %error,
            retry_in_secs = after.as_secs(),
            "Job failed; retrying"
        );
        pending.repost(after).await?;
        Ok(JobOutcome::Retrying { after })
    }
}

/// Worker for processing jobs from a queue.
pub struct Worker {
    executor: Arc<Executor>,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Create a new worker.
    pub fn new(queue: Queue) -> Self {
        let config = WorkerConfig::for_queue(&queue);
        Self::with_config(queue, config)
    }

    /// Create a worker with custom configuration.
    ///
    /// Failures are recorded in the queue's own failed list unless
    /// [`with_failed_recorder`](Worker::with_failed_recorder) says otherwise.
    pub fn with_config(queue: Queue, config: WorkerConfig) -> Self {
        let recorder: Arc<dyn FailedJobRecorder> = Arc::new(queue.failed_jobs());
        Self {
            executor: Arc::new(Executor {
                queue,
                handlers: RwLock::new(HashMap::new()),
                recorder: RwLock::new(recorder),
                config,
            }),
            running: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    /// Send permanently failed jobs to `recorder`.
    pub fn with_failed_recorder(self, recorder: Arc<dyn FailedJobRecorder>) -> Self {
        *self.executor.recorder.write() = recorder;
        self
    }

    /// Register a job handler.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use armature_workqueue::*;
    ///
    /// # async fn example() -> QueueResult<()> {
    /// let queue = Queue::new("redis://localhost:6379", "default").await?;
    /// let mut worker = Worker::new(queue);
    ///
    /// worker.register_handler("send_email", |job| async move {
    ///     println!("Sending email: {}", job.target);
    ///     Ok(())
    /// });
    /// # Ok(())
    /// # }
    /// ```
    pub fn register_handler<F, Fut>(&mut self, job_name: impl Into<String>, handler: F)
    where
        F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<()>> + Send + 'static,
    {
        let wrapped_handler: JobHandler = Arc::new(
            move |job: JobRecord| -> Pin<Box<dyn Future<Output = QueueResult<()>> + Send>> {
                Box::pin(handler(job))
            },
        );

        self.executor
            .handlers
            .write()
            .insert(job_name.into(), wrapped_handler);
    }

    /// The queue this worker consumes.
    pub fn queue(&self) -> &Queue {
        &self.executor.queue
    }

    /// Worker configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.executor.config
    }

    /// Dequeue and process a single job, waiting up to the block timeout.
    pub async fn run_once(&self) -> QueueResult<Option<JobOutcome>> {
        self.executor.run_once().await
    }

    /// Start the worker.
    pub async fn start(&mut self) -> QueueResult<()> {
        if self.executor.config.concurrency == 0 {
            return Err(QueueError::Config(
                "worker concurrency must be at least 1".into(),
            ));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::WorkerAlreadyRunning);
        }
        self.handles.retain(|handle| !handle.is_finished());

        let started_at = self.executor.queue.now();
        info!(
            queue = %self.executor.queue.name(),
            concurrency = self.executor.config.concurrency,
            "Worker starting"
        );

        for id in 0..self.executor.config.concurrency {
            let executor = self.executor.clone();
            let running = self.running.clone();
            self.handles
                .push(tokio::spawn(run_loop(executor, running, started_at, id)));
        }

        Ok(())
    }

    /// Stop the worker, letting in-flight jobs finish.
    pub async fn stop(&mut self) -> QueueResult<()> {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if !was_running && self.handles.is_empty() {
            return Err(QueueError::WorkerNotRunning);
        }

        info!(queue = %self.executor.queue.name(), "Worker stopping");
        self.join().await;
        info!(queue = %self.executor.queue.name(), "Worker stopped");

        Ok(())
    }

    /// Wait until every worker task has exited, e.g. after a restart signal.
    pub async fn wait(&mut self) {
        self.join().await;
        self.running.store(false, Ordering::SeqCst);
    }

    /// Check if the worker is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(queue = %self.executor.queue.name(), error = %e, "Worker task panicked");
            }
        }
    }
}

async fn run_loop(
    executor: Arc<Executor>,
    running: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
    id: usize,
) {
    let queue = executor.queue.name().to_string();
    debug!(queue = %queue, worker = id, "Worker task started");

    while running.load(Ordering::SeqCst) {
        match executor.queue.shall_worker_restart(started_at).await {
            Ok(true) => {
                info!(queue = %queue, worker = id, "Restart signal received");
                running.store(false, Ordering::SeqCst);
                break;
            }
            Ok(false) => {}
            Err(e) => {
                error!(queue = %queue, worker = id, error = %e, "Failed to read restart signal");
                tokio::time::sleep(executor.config.error_backoff).await;
                continue;
            }
        }

        if let Err(e) = executor.run_once().await {
            error!(queue = %queue, worker = id, error = %e, "Worker iteration failed");
            tokio::time::sleep(executor.config.error_backoff).await;
        }
    }

    debug!(queue = %queue, worker = id, "Worker task stopped");
}
