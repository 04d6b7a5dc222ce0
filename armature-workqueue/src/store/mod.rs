//! Backing store contract.
//!
//! The queue needs lists, sorted sets, scalars with a TTL and a way to run
//! a handful of multi-key transitions atomically. Redis provides all of it
//! through Lua scripts; [`MemoryStore`] provides it under a single lock.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::error::QueueResult;
use async_trait::async_trait;
use std::time::Duration;

/// Value pushed onto the notify list. Only its presence matters.
pub const NOTIFY_SENTINEL: &str = "1";

/// One of the atomic queue transitions.
///
/// Scores are Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<'a> {
    /// Append `record` to `main` and signal `notify`.
    Push {
        main: &'a str,
        notify: &'a str,
        record: &'a str,
    },
    /// Move the head of `main` into `reserved`, scored by `visibility_deadline`.
    Pop {
        main: &'a str,
        reserved: &'a str,
        notify: &'a str,
        visibility_deadline: i64,
    },
    /// Move every member of `source` scored at or below `now` onto `main`.
    MigrateMatured {
        source: &'a str,
        main: &'a str,
        notify: &'a str,
        now: i64,
    },
    /// Move `member` from `reserved` into `delayed`, scored by `matured_at`.
    RepostReserved {
        delayed: &'a str,
        reserved: &'a str,
        member: &'a str,
        matured_at: i64,
    },
    /// Store `max(current, at)` in the scalar `key`, expiring after `ttl`.
    ///
    /// A current value that is not an integer is replaced.
    RaiseSignal {
        key: &'a str,
        at: i64,
        ttl: Duration,
    },
}

impl Transition<'_> {
    /// Operation name, for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Push { .. } => "push",
            Self::Pop { .. } => "pop",
            Self::MigrateMatured { .. } => "migrate_matured",
            Self::RepostReserved { .. } => "repost_reserved",
            Self::RaiseSignal { .. } => "raise_signal",
        }
    }
}

/// A record moved from `main` into `reserved`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// The record exactly as it was popped
    pub job: String,
    /// The member inserted into `reserved`
    pub token: String,
}

/// Result of a [`Transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Push completed
    Pushed,
    /// Pop completed; `None` when `main` was empty
    Popped(Option<Reservation>),
    /// Number of members migrated
    Migrated(usize),
    /// Whether the reserved member was found and moved
    Reposted(bool),
    /// The value the signal holds afterwards
    Signalled(i64),
}

/// Store operations the queue is built from.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append to the tail of a list.
    async fn list_push_back(&self, key: &str, value: &str) -> QueueResult<()>;

    /// Pop the head of a list.
    async fn list_pop_front(&self, key: &str) -> QueueResult<Option<String>>;

    /// Pop the head of a list, waiting up to `timeout` for one to appear.
    async fn list_pop_front_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> QueueResult<Option<String>>;

    /// Length of a list.
    async fn list_len(&self, key: &str) -> QueueResult<usize>;

    /// Every element of a list, head first.
    async fn list_range(&self, key: &str) -> QueueResult<Vec<String>>;

    /// Insert or rescore a sorted-set member.
    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> QueueResult<()>;

    /// Rescore a member only if it is already present. Returns whether the
    /// score changed.
    async fn sorted_set_update(&self, key: &str, score: i64, member: &str) -> QueueResult<bool>;

    /// Remove a sorted-set member. Returns whether it was present.
    async fn sorted_set_remove(&self, key: &str, member: &str) -> QueueResult<bool>;

    /// Members scored at or below `max_score`, ascending.
    async fn sorted_set_range_by_score(&self, key: &str, max_score: i64)
    -> QueueResult<Vec<String>>;

    /// Cardinality of a sorted set.
    async fn sorted_set_len(&self, key: &str) -> QueueResult<usize>;

    /// Read a scalar.
    async fn get(&self, key: &str) -> QueueResult<Option<String>>;

    /// Write a scalar, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()>;

    /// Delete keys of any type.
    async fn delete(&self, keys: &[String]) -> QueueResult<()>;

    /// Run a transition as one indivisible step.
    async fn execute_atomic(&self, transition: Transition<'_>) -> QueueResult<TransitionOutcome>;
}

/// The reservation member for a popped record: `attempts` incremented.
///
/// Mirrors the Redis pop script. Anything that does not look like a record
/// is reserved unchanged so the consumer can quarantine it.
pub(crate) fn reservation_member(job: &str) -> String {
    let mut value: serde_json::Value = match serde_json::from_str(job) {
        Ok(value) => value,
        Err(_) => return job.to_string(),
    };

    let bumped = value
        .as_object_mut()
        .and_then(|fields| fields.get_mut("attempts"))
        .and_then(|attempts| {
            let next = attempts.as_u64()?.checked_add(1)?;
            *attempts = serde_json::Value::from(next);
            Some(())
        });

    match bumped {
        Some(()) => serde_json::to_string(&value).unwrap_or_else(|_| job.to_string()),
        None => job.to_string(),
    }
}
