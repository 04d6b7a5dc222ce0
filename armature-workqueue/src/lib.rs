//! Redis-backed work queue for Armature framework.
//!
//! Provides an at-least-once job queue with:
//! - 📦 Redis persistence, with every cross-container move done in one Lua script
//! - ⏰ Delayed jobs
//! - 👀 Visibility timeouts, so jobs held by a crashed worker run again
//! - 🔄 Retries with exponential backoff
//! - 💀 Failed-job recording and resubmission
//! - 🔁 Worker restart signal
//! - 👷 Worker pools
//!
//! A job lives in exactly one of three containers at a time: the main list,
//! the delayed set (scored by maturity time) or the reserved set (scored by
//! visibility deadline). Due delayed jobs and expired reservations are swept
//! back onto the main list before every dequeue.
//!
//! ## Job Options
//!
//! ```
//! use armature_workqueue::{JobOptions, JobRecord};
//! use std::time::Duration;
//!
//! let options = JobOptions::new("send_welcome")
//!     .with_id("user-42")
//!     .with_max_attempts(5)
//!     .with_retry_delay(Duration::from_secs(10))
//!     .with_running_timeout(Duration::from_secs(120));
//!
//! let record = JobRecord::from_options(r#"{"to":"user@example.com"}"#, &options).unwrap();
//!
//! assert_eq!(record.id, "user-42");
//! assert_eq!(record.max_attempts, 5);
//! assert_eq!(record.attempts, 0);
//! ```
//!
//! ## Queue Configuration
//!
//! ```
//! use armature_workqueue::{QueueConfig, StoreConfig};
//! use std::time::Duration;
//!
//! let store = StoreConfig::new("redis://localhost:6379").with_database(2);
//! assert_eq!(store.connection_url(), "redis://localhost:6379/2");
//!
//! let config = QueueConfig::new("emails")
//!     .with_key_prefix("myapp")
//!     .with_default_running_timeout(Duration::from_secs(300));
//!
//! assert_eq!(config.keys().main, "myapp:emails");
//! assert_eq!(config.keys().reserved, "myapp:emails:reserved");
//! ```
//!
//! ## Consuming Jobs By Hand
//!
//! ```
//! use armature_workqueue::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> QueueResult<()> {
//! let queue = Queue::with_store(Arc::new(MemoryStore::new()), QueueConfig::new("default"));
//!
//! queue.enqueue("payload", JobOptions::new("resize_image")).await?;
//!
//! if let Some(pending) = queue.dequeue(Some(Duration::from_secs(1))).await? {
//!     match pending.target() {
//!         "payload" => {
//!             pending.ack().await?;
//!         }
//!         _ => {
//!             pending.repost(Duration::from_secs(30)).await?;
//!         }
//!     }
//! }
//!
//! assert_eq!(queue.size().await?, 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Complete Example
//!
//! ```no_run
//! use armature_workqueue::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     // Create a queue
//!     let queue = Queue::new("redis://localhost:6379", "default").await?;
//!
//!     // Enqueue a job
//!     let job_id = queue
//!         .enqueue(
//!             r#"{"to":"user@example.com","subject":"Hello"}"#,
//!             JobOptions::new("send_email"),
//!         )
//!         .await?;
//!
//!     // Process jobs
//!     let mut worker = Worker::new(queue.clone());
//!     worker.register_handler("send_email", |job| async move {
//!         println!("Sending email: {}", job.target);
//!         Ok(())
//!     });
//!
//!     worker.start().await?;
//!
//!     // Elsewhere: ask every running worker to restart after a deploy
//!     queue.signal_worker_restart(None).await?;
//!     worker.wait().await;
//!
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod failed;
pub mod job;
pub mod keys;
pub mod pending;
pub mod queue;
pub mod store;
pub mod transitions;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{QueueConfig, StoreConfig};
pub use error::{QueueError, QueueResult};
pub use failed::{FailedJob, FailedJobRecorder, StoreFailedJobs};
pub use job::{JobId, JobOptions, JobRecord, MAX_BACKOFF};
pub use keys::QueueKeys;
pub use pending::PendingJob;
pub use queue::{Queue, QueueStats, SweepReport};
pub use store::{MemoryStore, QueueStore, RedisStore};
pub use worker::{JobHandler, JobOutcome, Worker, WorkerConfig};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{QueueConfig, StoreConfig};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::failed::{FailedJob, FailedJobRecorder};
    pub use crate::job::{JobId, JobOptions, JobRecord};
    pub use crate::pending::PendingJob;
    pub use crate::queue::Queue;
    pub use crate::worker::{JobHandler, JobOutcome, Worker, WorkerConfig};
}
