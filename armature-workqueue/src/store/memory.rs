//! In-process queue store for tests and local development.

use super::{
    NOTIFY_SENTINEL, QueueStore, Reservation, Transition, TransitionOutcome, reservation_member,
};
use crate::error::QueueResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn add(&mut self, score: i64, member: &str) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(previous, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn update(&mut self, score: i64, member: &str) -> bool {
        match self.scores.get(member) {
            Some(&previous) if previous != score => {
                self.add(score, member);
                true
            }
            _ => false,
        }
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn range_by_score(&self, max_score: i64) -> Vec<String> {
        self.ordered
            .iter()
            .take_while(|(score, _)| *score <= max_score)
            .map(|(_, member)| member.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }
}

#[derive(Debug)]
struct Scalar {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, SortedSet>,
    scalars: HashMap<String, Scalar>,
}

impl State {
    fn push_back(&mut self, key: &str, value: &str) {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
    }

    fn pop_front(&mut self, key: &str) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_front();
        if list.is_empty() {
            self.lists.remove(key);
        }
        value
    }

    fn zadd(&mut self, key: &str, score: i64, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .add(score, member);
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.sets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.ordered.is_empty() {
            self.sets.remove(key);
        }
        removed
    }

    fn zrange(&self, key: &str, max_score: i64) -> Vec<String> {
        self.sets
            .get(key)
            .map(|set| set.range_by_score(max_score))
            .unwrap_or_default()
    }

    fn live_scalar(&mut self, key: &str) -> Option<&str> {
        let expired = self
            .scalars
            .get(key)
            .and_then(|scalar| scalar.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.scalars.remove(key);
        }
        self.scalars.get(key).map(|scalar| scalar.value.as_str())
    }

    fn set_scalar(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        self.scalars.insert(
            key.to_string(),
            Scalar {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn apply(&mut self, transition: Transition<'_>) -> TransitionOutcome {
        match transition {
            Transition::Push {
                main,
                notify,
                record,
            } => {
                self.push_back(main, record);
                self.push_back(notify, NOTIFY_SENTINEL);
                TransitionOutcome::Pushed
            }
            Transition::Pop {
                main,
                reserved,
                notify,
                visibility_deadline,
            } => {
                let Some(job) = self.pop_front(main) else {
                    return TransitionOutcome::Popped(None);
                };
                let token = reservation_member(&job);
                self.zadd(reserved, visibility_deadline, &token);
                self.pop_front(notify);
                TransitionOutcome::Popped(Some(Reservation { job, token }))
            }
            Transition::MigrateMatured {
                source,
                main,
                notify,
                now,
            } => {
                let due = self.zrange(source, now);
                for member in &due {
                    self.zrem(source, member);
                    self.push_back(main, member);
                }
                if !due.is_empty() {
                    self.push_back(notify, NOTIFY_SENTINEL);
                }
                TransitionOutcome::Migrated(due.len())
            }
            Transition::RepostReserved {
                delayed,
                reserved,
                member,
                matured_at,
            } => {
                let moved = self.zrem(reserved, member);
                if moved {
                    self.zadd(delayed, matured_at, member);
                }
                TransitionOutcome::Reposted(moved)
            }
            Transition::RaiseSignal { key, at, ttl } => {
                let current = self
                    .live_scalar(key)
                    .and_then(|value| value.parse::<i64>().ok());
                let value = current.map_or(at, |current| current.max(at));
                self.set_scalar(key, value.to_string(), Some(ttl));
                TransitionOutcome::Signalled(value)
            }
        }
    }
}

/// Queue store held in process memory.
///
/// Every operation runs under one lock, which makes each transition atomic
/// with respect to every other caller. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    pushed: Arc<Notify>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a list, head first.
    pub fn list_snapshot(&self, key: &str) -> Vec<String> {
        self.state
            .lock()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of a sorted set as `(score, member)` pairs, ascending.
    pub fn sorted_set_snapshot(&self, key: &str) -> Vec<(i64, String)> {
        self.state
            .lock()
            .sets
            .get(key)
            .map(|set| set.ordered.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let result = f(&mut self.state.lock());
        self.pushed.notify_waiters();
        result
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn list_push_back(&self, key: &str, value: &str) -> QueueResult<()> {
        self.mutate(|state| state.push_back(key, value));
        Ok(())
    }

    async fn list_pop_front(&self, key: &str) -> QueueResult<Option<String>> {
        Ok(self.state.lock().pop_front(key))
    }

    async fn list_pop_front_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> QueueResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register before checking so a push in between is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = self.state.lock().pop_front(key);
            if popped.is_some() {
                return Ok(popped);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn list_len(&self, key: &str) -> QueueResult<usize> {
        Ok(self.state.lock().lists.get(key).map_or(0, VecDeque::len))
    }

    async fn list_range(&self, key: &str) -> QueueResult<Vec<String>> {
        Ok(self.list_snapshot(key))
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> QueueResult<()> {
        self.state.lock().zadd(key, score, member);
        Ok(())
    }

    async fn sorted_set_update(&self, key: &str, score: i64, member: &str) -> QueueResult<bool> {
        Ok(self
            .state
            .lock()
            .sets
            .get_mut(key)
            .is_some_and(|set| set.update(score, member)))
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> QueueResult<bool> {
        Ok(self.state.lock().zrem(key, member))
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        max_score: i64,
    ) -> QueueResult<Vec<String>> {
        Ok(self.state.lock().zrange(key, max_score))
    }

    async fn sorted_set_len(&self, key: &str) -> QueueResult<usize> {
        Ok(self.state.lock().sets.get(key).map_or(0, SortedSet::len))
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        Ok(self.state.lock().live_scalar(key).map(str::to_string))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()> {
        self.state
            .lock()
            .set_scalar(key, value.to_string(), ttl);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> QueueResult<()> {
        let mut state = self.state.lock();
        for key in keys {
            state.lists.remove(key);
            state.sets.remove(key);
            state.scalars.remove(key);
        }
        Ok(())
    }

    async fn execute_atomic(&self, transition: Transition<'_>) -> QueueResult<TransitionOutcome> {
        Ok(self.mutate(|state| state.apply(transition)))
    }
}
