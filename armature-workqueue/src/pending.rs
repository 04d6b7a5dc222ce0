//! Handle for a reserved job.

use crate::error::QueueResult;
use crate::failed::{FailedJob, FailedJobRecorder};
use crate::job::JobRecord;
use crate::queue::Queue;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tracing::info;

/// A job checked out of a queue.
///
/// The job stays in the reserved set until it is resolved with [`ack`],
/// [`repost`] or [`fail`], each of which consumes the handle. A handle that
/// is dropped unresolved leaves the job to be redelivered once its
/// visibility deadline passes.
///
/// [`ack`]: PendingJob::ack
/// [`repost`]: PendingJob::repost
/// [`fail`]: PendingJob::fail
pub struct PendingJob {
    queue: Queue,
    record: JobRecord,
    token: String,
    reserved_at: DateTime<Utc>,
    visibility_deadline: DateTime<Utc>,
}

impl PendingJob {
    pub(crate) fn new(
        queue: Queue,
        record: JobRecord,
        token: String,
        reserved_at: DateTime<Utc>,
        visibility_deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            queue,
            record,
            token,
            reserved_at,
            visibility_deadline,
        }
    }

    /// The record as it was popped.
    pub fn job(&self) -> &JobRecord {
        &self.record
    }

    /// Job identifier.
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Job name, which workers dispatch on.
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Opaque serialized runnable.
    pub fn target(&self) -> &str {
        &self.record.target
    }

    /// Deliveries before this one.
    pub fn attempts(&self) -> u32 {
        self.record.attempts
    }

    /// The reserved-set member identifying this delivery.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the job was reserved.
    pub fn reserved_at(&self) -> DateTime<Utc> {
        self.reserved_at
    }

    /// After this time the job may be handed to another consumer.
    pub fn visibility_deadline(&self) -> DateTime<Utc> {
        self.visibility_deadline
    }

    /// How long the handler may run before the reservation lapses.
    pub fn running_timeout(&self) -> Duration {
        self.record
            .running_timeout(self.queue.config().default_running_timeout)
    }

    /// Whether this is the final delivery allowed.
    pub fn is_last_attempt(&self) -> bool {
        self.record.is_last_attempt()
    }

    /// Consume the handle without resolving the reservation.
    pub fn into_job(self) -> JobRecord {
        self.record
    }

    /// Mark the job done. Returns `false` if the reservation had already
    /// lapsed, in which case the job may run again elsewhere.
    pub async fn ack(self) -> QueueResult<bool> {
        self.queue.delete_reserved(&self.token).await
    }

    /// Put the job back to run again after `after`.
    ///
    /// The next delivery sees `attempts` one higher. Returns `false` when the
    /// reservation had already lapsed and nothing was moved.
    pub async fn repost(self, after: Duration) -> QueueResult<bool> {
        let matured_at = self.queue.after(after)?;
        self.queue.repost_reserved(&self.token, matured_at).await
    }

    /// Record the job as permanently failed and drop its reservation.
    ///
    /// The failure is written before the reservation is removed, so a crash
    /// in between leads to a redelivery rather than a lost job.
    pub async fn fail(
        self,
        error: impl Into<String>,
        recorder: &dyn FailedJobRecorder,
    ) -> QueueResult<bool> {
        let failed = FailedJob::from_record(
            self.queue.name(),
            &self.record,
            error,
            self.queue.now(),
        );
        recorder.record(failed).await?;

        info!(
            queue = %self.queue.name(),
            job_id = %self.record.id,
            job = %self.record.name,
            attempts = self.record.attempts.saturating_add(1),
            "Job failed permanently"
        );

        self.queue.delete_reserved(&self.token).await
    }
}

impl fmt::Debug for PendingJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingJob")
            .field("queue", &self.queue.name())
            .field("record", &self.record)
            .field("reserved_at", &self.reserved_at)
            .field("visibility_deadline", &self.visibility_deadline)
            .finish()
    }
}
