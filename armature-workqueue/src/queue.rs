//! Queue facade over the backing store.

use crate::clock::{Clock, SystemClock, ceil_timestamp};
use crate::codec;
use crate::config::{QueueConfig, StoreConfig};
use crate::error::{QueueError, QueueResult};
use crate::failed::{FailedJob, StoreFailedJobs};
use crate::job::{JobId, JobOptions, JobRecord};
use crate::keys::QueueKeys;
use crate::pending::PendingJob;
use crate::store::{QueueStore, RedisStore, Reservation};
use crate::transitions;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of one migration sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Delayed jobs that became runnable
    pub matured: usize,
    /// Reservations whose visibility deadline passed
    pub expired: usize,
}

/// Container sizes for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs ready to run
    pub ready: usize,
    /// Jobs waiting for their maturity time
    pub delayed: usize,
    /// Jobs checked out by consumers
    pub reserved: usize,
    /// Recorded failures
    pub failed: usize,
    /// Records set aside because they could not be decoded
    pub quarantined: usize,
}

/// A named work queue.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    keys: QueueKeys,
}

impl Queue {
    /// Connect to Redis at `redis_url` and open `queue_name`.
    pub async fn new(
        redis_url: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> QueueResult<Self> {
        Self::connect(&StoreConfig::new(redis_url), QueueConfig::new(queue_name)).await
    }

    /// Connect to Redis with explicit store and queue settings.
    pub async fn connect(store_config: &StoreConfig, config: QueueConfig) -> QueueResult<Self> {
        let store = RedisStore::connect(store_config).await?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    /// Open a queue on an existing store.
    pub fn with_store(store: Arc<dyn QueueStore>, config: QueueConfig) -> Self {
        let keys = config.keys();
        info!(queue = %config.queue_name, main = %keys.main, "Job queue ready");
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
            keys,
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.config.queue_name
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Store keys owned by this queue.
    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Current time according to the queue's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The time `delay` from now.
    pub(crate) fn after(&self, delay: Duration) -> QueueResult<DateTime<Utc>> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| QueueError::InvalidJob(format!("delay out of range: {}", e)))?;
        self.now()
            .checked_add_signed(delay)
            .ok_or_else(|| QueueError::InvalidJob("delay out of range".into()))
    }

    /// Enqueue `target` as a new job. Returns the job id.
    pub async fn enqueue(
        &self,
        target: impl Into<String>,
        options: JobOptions,
    ) -> QueueResult<JobId> {
        let record = JobRecord::from_options(target, &options)?;
        self.enqueue_record(&record, options.delay).await?;
        Ok(record.id)
    }

    /// Enqueue a prebuilt record, optionally held back by `delay`.
    pub async fn enqueue_record(
        &self,
        record: &JobRecord,
        delay: Option<Duration>,
    ) -> QueueResult<()> {
        let encoded = codec::encode(record)?;

        match delay.filter(|delay| !delay.is_zero()) {
            None => {
                transitions::push(self.store.as_ref(), &self.keys, &encoded).await?;
                debug!(queue = %self.name(), job_id = %record.id, job = %record.name, "Job enqueued");
            }
            Some(delay) => {
                let matured_at = ceil_timestamp(self.after(delay)?);
                self.store
                    .sorted_set_add(&self.keys.delayed, matured_at, &encoded)
                    .await?;
                debug!(
                    queue = %self.name(),
                    job_id = %record.id,
                    job = %record.name,
                    matured_at,
                    "Job scheduled"
                );
            }
        }

        Ok(())
    }

    /// Resubmit a job from an encoded [`FailedJob`]. Attempts start over.
    pub async fn enqueue_failed(&self, encoded_failure: &str) -> QueueResult<JobId> {
        let failed = FailedJob::decode(encoded_failure)?;
        let record = failed.to_record();
        let encoded = codec::encode(&record)?;

        transitions::push(self.store.as_ref(), &self.keys, &encoded).await?;
        info!(
            queue = %self.name(),
            job_id = %record.id,
            failed_on = %failed.queue,
            "Failed job resubmitted"
        );
        Ok(record.id)
    }

    /// Take the next job, reserving it until its visibility deadline.
    ///
    /// Due delayed jobs and expired reservations are moved back onto the main
    /// list first. With a `timeout`, an empty queue is waited on for up to
    /// that long. Store faults are returned as errors, never as `None`.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> QueueResult<Option<PendingJob>> {
        self.sweep().await?;

        if let Some(pending) = self.pop_next().await? {
            return Ok(Some(pending));
        }

        let Some(timeout) = timeout.filter(|timeout| !timeout.is_zero()) else {
            return Ok(None);
        };

        if self
            .store
            .list_pop_front_blocking(&self.keys.notify, timeout)
            .await?
            .is_none()
        {
            return Ok(None);
        }

        self.sweep().await?;
        self.pop_next().await
    }

    async fn pop_next(&self) -> QueueResult<Option<PendingJob>> {
        loop {
            let now = self.now();
            let default_deadline = self.after(self.config.default_running_timeout)?;

            let Some(reservation) =
                transitions::pop(self.store.as_ref(), &self.keys, ceil_timestamp(default_deadline))
                    .await?
            else {
                return Ok(None);
            };

            let record = match codec::decode(&reservation.job) {
                Ok(record) => record,
                Err(e) => {
                    self.quarantine(&reservation, &e).await?;
                    continue;
                }
            };

            let mut deadline = default_deadline;
            if record.running_timeout_seconds > 0 {
                // Timeouts past chrono's range keep the reservation indefinitely.
                deadline = self
                    .after(record.running_timeout(self.config.default_running_timeout))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                if deadline != default_deadline {
                    self.store
                        .sorted_set_update(&self.keys.reserved, ceil_timestamp(deadline), &reservation.token)
                        .await?;
                }
            }

            debug!(
                queue = %self.name(),
                job_id = %record.id,
                job = %record.name,
                attempts = record.attempts,
                "Job reserved"
            );

            return Ok(Some(PendingJob::new(
                self.clone(),
                record,
                reservation.token,
                now,
                deadline,
            )));
        }
    }

    /// Set an undecodable record aside so it neither blocks the queue nor
    /// disappears. It is written to `quarantine` before leaving `reserved`.
    async fn quarantine(&self, reservation: &Reservation, cause: &QueueError) -> QueueResult<()> {
        error!(
            queue = %self.name(),
            error = %cause,
            "Quarantining undecodable job record"
        );
        self.store
            .list_push_back(&self.keys.quarantine, &reservation.job)
            .await?;
        self.store
            .sorted_set_remove(&self.keys.reserved, &reservation.token)
            .await?;
        Ok(())
    }

    /// Acknowledge a reservation. Returns whether it was still reserved.
    pub async fn delete_reserved(&self, token: &str) -> QueueResult<bool> {
        let removed = self
            .store
            .sorted_set_remove(&self.keys.reserved, token)
            .await?;
        if !removed {
            warn!(
                queue = %self.name(),
                "Acknowledged a reservation that was no longer held"
            );
        }
        Ok(removed)
    }

    /// Move a reservation into the delayed set, runnable at `matured_at`.
    ///
    /// Returns `false` without touching anything when the token is no longer
    /// reserved (already acknowledged, or expired and re-queued).
    pub async fn repost_reserved(&self, token: &str, matured_at: DateTime<Utc>) -> QueueResult<bool> {
        let moved = transitions::repost_reserved(
            self.store.as_ref(),
            &self.keys,
            token,
            ceil_timestamp(matured_at),
        )
        .await?;
        if !moved {
            warn!(
                queue = %self.name(),
                "Reposted a reservation that was no longer held"
            );
        }
        Ok(moved)
    }

    /// Move due delayed jobs and expired reservations onto the main list.
    pub async fn sweep(&self) -> QueueResult<SweepReport> {
        let now = self.now().timestamp();

        let matured =
            transitions::migrate_matured(self.store.as_ref(), &self.keys, &self.keys.delayed, now)
                .await?;
        let expired =
            transitions::migrate_matured(self.store.as_ref(), &self.keys, &self.keys.reserved, now)
                .await?;

        if matured > 0 {
            debug!(queue = %self.name(), matured, "Delayed jobs matured");
        }
        if expired > 0 {
            warn!(queue = %self.name(), expired, "Expired reservations re-queued");
        }

        Ok(SweepReport { matured, expired })
    }

    /// Tell every worker started before now to restart.
    ///
    /// The stored time never moves backwards while a signal is live.
    /// Returns the effective signal time.
    pub async fn signal_worker_restart(&self, ttl: Option<Duration>) -> QueueResult<DateTime<Utc>> {
        let effective = transitions::raise_restart_signal(
            self.store.as_ref(),
            &self.keys,
            self.now().timestamp_millis(),
            ttl.unwrap_or(self.config.restart_signal_ttl),
        )
        .await?;

        info!(queue = %self.name(), at = effective, "Worker restart signalled");
        millis_to_datetime(effective)
    }

    /// Time of the live restart signal, if any.
    pub async fn restart_signal(&self) -> QueueResult<Option<DateTime<Utc>>> {
        self.restart_signal_millis()
            .await?
            .map(millis_to_datetime)
            .transpose()
    }

    /// Whether a worker started at `since` must restart.
    pub async fn shall_worker_restart(&self, since: DateTime<Utc>) -> QueueResult<bool> {
        Ok(self
            .restart_signal_millis()
            .await?
            .is_some_and(|signal| since.timestamp_millis() < signal))
    }

    async fn restart_signal_millis(&self) -> QueueResult<Option<i64>> {
        match self.store.get(&self.keys.restart).await? {
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|e| QueueError::corrupt(raw, e)),
            None => Ok(None),
        }
    }

    /// Number of jobs ready to run.
    pub async fn size(&self) -> QueueResult<usize> {
        self.store.list_len(&self.keys.main).await
    }

    /// Sizes of every container.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(QueueStats {
            ready: self.store.list_len(&self.keys.main).await?,
            delayed: self.store.sorted_set_len(&self.keys.delayed).await?,
            reserved: self.store.sorted_set_len(&self.keys.reserved).await?,
            failed: self.store.list_len(&self.keys.failed).await?,
            quarantined: self.store.list_len(&self.keys.quarantine).await?,
        })
    }

    /// Raw strings that were quarantined, oldest first.
    pub async fn quarantined(&self) -> QueueResult<Vec<String>> {
        self.store.list_range(&self.keys.quarantine).await
    }

    /// Store-backed failed-job recorder for this queue.
    pub fn failed_jobs(&self) -> StoreFailedJobs {
        StoreFailedJobs::new(self.store.clone(), &self.keys)
    }

    /// Delete every key the queue owns.
    pub async fn clear(&self) -> QueueResult<()> {
        self.store.delete(&self.keys.all()).await?;
        info!(queue = %self.name(), "Queue cleared");
        Ok(())
    }
}

fn millis_to_datetime(millis: i64) -> QueueResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| QueueError::corrupt(millis.to_string(), "timestamp out of range"))
}
