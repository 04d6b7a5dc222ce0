//! Recording jobs that exhausted their attempts.

use crate::error::{QueueError, QueueResult};
use crate::job::{JobId, JobRecord};
use crate::keys::QueueKeys;
use crate::store::QueueStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// A job that will not be retried again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    /// Job identifier
    pub id: JobId,
    /// Queue the job ran on
    pub queue: String,
    /// Job name
    pub name: String,
    /// Opaque serialized runnable
    pub target: String,
    /// Delivery limit the job had
    pub max_attempts: u32,
    /// Deliveries used, including the failing one
    pub attempts: u32,
    /// Backoff base in seconds
    pub retry_after_seconds: u64,
    /// Visibility timeout in seconds
    pub running_timeout_seconds: u64,
    /// Last error message
    pub error: String,
    /// When the job was given up on
    pub failed_at: DateTime<Utc>,
}

impl FailedJob {
    /// Describe the final failed delivery of `record`.
    pub fn from_record(
        queue: impl Into<String>,
        record: &JobRecord,
        error: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: record.id.clone(),
            queue: queue.into(),
            name: record.name.clone(),
            target: record.target.clone(),
            max_attempts: record.max_attempts,
            attempts: record.attempts.saturating_add(1),
            retry_after_seconds: record.retry_after_seconds,
            running_timeout_seconds: record.running_timeout_seconds,
            error: error.into(),
            failed_at,
        }
    }

    /// A fresh record for resubmission, with the attempt count reset.
    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            retry_after_seconds: self.retry_after_seconds,
            running_timeout_seconds: self.running_timeout_seconds,
            max_attempts: self.max_attempts.max(1),
            attempts: 0,
            target: self.target.clone(),
        }
    }

    /// Encode for storage.
    pub fn encode(&self) -> QueueResult<String> {
        serde_json::to_string(self).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    /// Decode a stored failure.
    pub fn decode(raw: &str) -> QueueResult<Self> {
        serde_json::from_str(raw).map_err(|e| QueueError::corrupt(raw, e))
    }
}

/// Destination for jobs that exhausted their attempts.
#[async_trait]
pub trait FailedJobRecorder: Send + Sync {
    /// Persist a failure.
    async fn record(&self, failed: FailedJob) -> QueueResult<()>;
}

/// Appends failures to the queue's `failed` list in the backing store.
#[derive(Clone)]
pub struct StoreFailedJobs {
    store: Arc<dyn QueueStore>,
    key: String,
}

impl StoreFailedJobs {
    /// Record into the `failed` list of the queue owning `keys`.
    pub fn new(store: Arc<dyn QueueStore>, keys: &QueueKeys) -> Self {
        Self {
            store,
            key: keys.failed.clone(),
        }
    }

    /// Every recorded failure, oldest first. Undecodable entries are skipped.
    pub async fn all(&self) -> QueueResult<Vec<FailedJob>> {
        let raw = self.store.list_range(&self.key).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| match FailedJob::decode(entry) {
                Ok(failed) => Some(failed),
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Skipping unreadable failed job");
                    None
                }
            })
            .collect())
    }

    /// Encoded failures as stored, suitable for `Queue::enqueue_failed`.
    pub async fn raw(&self) -> QueueResult<Vec<String>> {
        self.store.list_range(&self.key).await
    }

    /// Number of recorded failures.
    pub async fn count(&self) -> QueueResult<usize> {
        self.store.list_len(&self.key).await
    }
}

#[async_trait]
impl FailedJobRecorder for StoreFailedJobs {
    async fn record(&self, failed: FailedJob) -> QueueResult<()> {
        let encoded = failed.encode()?;
        self.store.list_push_back(&self.key, &encoded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn failed() -> FailedJob {
        let mut record = JobRecord::new("send_email", "target");
        record.id = "42".into();
        record.attempts = 2;
        record.max_attempts = 3;
        FailedJob::from_record("emails", &record, "smtp down", Utc::now())
    }

    #[test]
    fn test_from_record_counts_final_attempt() {
        let failed = failed();
        assert_eq!(failed.attempts, 3);
        assert_eq!(failed.queue, "emails");
        assert_eq!(failed.error, "smtp down");
    }

    #[test]
    fn test_to_record_resets_attempts() {
        let record = failed().to_record();
        assert_eq!(record.id, "42");
        assert_eq!(record.attempts, 0);
        assert_eq!(record.max_attempts, 3);
        assert_eq!(record.target, "target");
    }

    #[test]
    fn test_encode_decode() {
        let original = failed();
        let decoded = FailedJob::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(FailedJob::decode("nope").unwrap_err().is_corrupt_record());
    }

    #[tokio::test]
    async fn test_store_recorder() {
        let store = Arc::new(MemoryStore::new());
        let keys = QueueKeys::new("emails");
        let recorder = StoreFailedJobs::new(store.clone(), &keys);

        recorder.record(failed()).await.unwrap();
        store.list_push_back(&keys.failed, "garbage").await.unwrap();

        assert_eq!(recorder.count().await.unwrap(), 2);
        let all = recorder.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "42");
    }
}
