//! Job record definition and producer options.

use crate::error::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Job identifier. Opaque: producer-supplied or a generated UUID.
pub type JobId = String;

/// Upper bound on the computed retry backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// The unit of work moved between queue containers.
///
/// A record is never mutated once it sits in the store. A retry writes a new
/// encoding with `attempts` incremented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Unique job identifier
    pub id: JobId,

    /// Human label, also the key workers dispatch on
    pub name: String,

    /// Backoff base for retries, in seconds
    pub retry_after_seconds: u64,

    /// Visibility timeout in seconds; 0 means the queue default
    pub running_timeout_seconds: u64,

    /// Maximum number of deliveries
    pub max_attempts: u32,

    /// Deliveries that ended in a retry or an expired reservation
    pub attempts: u32,

    /// Opaque serialized runnable
    pub target: String,
}

impl JobRecord {
    /// Create a record with a generated id and default retry settings.
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            retry_after_seconds: 1,
            running_timeout_seconds: 0,
            max_attempts: 3,
            attempts: 0,
            target: target.into(),
        }
    }

    /// Build a record from producer options.
    pub fn from_options(target: impl Into<String>, options: &JobOptions) -> QueueResult<Self> {
        options.validate()?;

        Ok(Self {
            id: options
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: options.name.clone(),
            retry_after_seconds: ceil_secs(options.retry_delay),
            running_timeout_seconds: options.running_timeout.map(ceil_secs).unwrap_or(0),
            max_attempts: options.max_attempts,
            attempts: 0,
            target: target.into(),
        })
    }

    /// Visibility timeout for this job, falling back to `default`.
    pub fn running_timeout(&self, default: Duration) -> Duration {
        if self.running_timeout_seconds == 0 {
            default
        } else {
            Duration::from_secs(self.running_timeout_seconds)
        }
    }

    /// Whether the current delivery is the last one allowed.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts.saturating_add(1) >= self.max_attempts
    }

    /// Exponential backoff: `retry_after * 2^attempts`, capped at `max`.
    pub fn retry_backoff(&self, max: Duration) -> Duration {
        let factor = 2_u64.saturating_pow(self.attempts.min(63));
        let seconds = self.retry_after_seconds.saturating_mul(factor);
        Duration::from_secs(seconds).min(max)
    }
}

/// Producer-side options for `Queue::enqueue`.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Explicit id; generated when `None`
    pub id: Option<JobId>,

    /// Job name
    pub name: String,

    /// Maximum number of deliveries (>= 1)
    pub max_attempts: u32,

    /// Hold the job back for this long before it becomes runnable
    pub delay: Option<Duration>,

    /// Backoff base between retries
    pub retry_delay: Duration,

    /// Visibility timeout; queue default when `None`
    pub running_timeout: Option<Duration>,
}

impl JobOptions {
    /// Options for a job called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            max_attempts: 3,
            delay: None,
            retry_delay: Duration::from_secs(1),
            running_timeout: None,
        }
    }

    /// Set the job id.
    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set max delivery attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay the first delivery.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set the retry backoff base.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Set the visibility timeout.
    pub fn with_running_timeout(mut self, running_timeout: Duration) -> Self {
        self.running_timeout = Some(running_timeout);
        self
    }

    fn validate(&self) -> QueueResult<()> {
        if self.max_attempts == 0 {
            return Err(QueueError::InvalidJob(format!(
                "job '{}' must allow at least one attempt",
                self.name
            )));
        }
        if self.id.as_deref() == Some("") {
            return Err(QueueError::InvalidJob("job id must not be empty".into()));
        }
        Ok(())
    }
}

/// Whole seconds, rounded up.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
