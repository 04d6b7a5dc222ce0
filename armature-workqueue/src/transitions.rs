//! Typed wrappers over the atomic store transitions.
//!
//! Every move of a record between `main`, `delayed` and `reserved` goes
//! through one of these; the queue never reads a container and writes
//! another in separate round trips.

use crate::error::{QueueError, QueueResult};
use crate::keys::QueueKeys;
use crate::store::{QueueStore, Reservation, Transition, TransitionOutcome};
use std::time::Duration;

fn unexpected(op: &str, outcome: TransitionOutcome) -> QueueError {
    QueueError::Store(format!("{} returned unexpected outcome {:?}", op, outcome))
}

/// Append `record` to `main` and signal `notify`.
pub async fn push(store: &dyn QueueStore, keys: &QueueKeys, record: &str) -> QueueResult<()> {
    match store
        .execute_atomic(Transition::Push {
            main: &keys.main,
            notify: &keys.notify,
            record,
        })
        .await?
    {
        TransitionOutcome::Pushed => Ok(()),
        other => Err(unexpected("push", other)),
    }
}

/// Reserve the head of `main` until `visibility_deadline`.
pub async fn pop(
    store: &dyn QueueStore,
    keys: &QueueKeys,
    visibility_deadline: i64,
) -> QueueResult<Option<Reservation>> {
    match store
        .execute_atomic(Transition::Pop {
            main: &keys.main,
            reserved: &keys.reserved,
            notify: &keys.notify,
            visibility_deadline,
        })
        .await?
    {
        TransitionOutcome::Popped(reservation) => Ok(reservation),
        other => Err(unexpected("pop", other)),
    }
}

/// Move members of `source` due at `now` onto `main`. Returns how many moved.
pub async fn migrate_matured(
    store: &dyn QueueStore,
    keys: &QueueKeys,
    source: &str,
    now: i64,
) -> QueueResult<usize> {
    match store
        .execute_atomic(Transition::MigrateMatured {
            source,
            main: &keys.main,
            notify: &keys.notify,
            now,
        })
        .await?
    {
        TransitionOutcome::Migrated(moved) => Ok(moved),
        other => Err(unexpected("migrate_matured", other)),
    }
}

/// Move a reserved member into `delayed`. Returns whether it was still reserved.
pub async fn repost_reserved(
    store: &dyn QueueStore,
    keys: &QueueKeys,
    member: &str,
    matured_at: i64,
) -> QueueResult<bool> {
    match store
        .execute_atomic(Transition::RepostReserved {
            delayed: &keys.delayed,
            reserved: &keys.reserved,
            member,
            matured_at,
        })
        .await?
    {
        TransitionOutcome::Reposted(moved) => Ok(moved),
        other => Err(unexpected("repost_reserved", other)),
    }
}

/// Raise the signal in `keys.restart` to at least `at`. Returns the stored value.
pub async fn raise_restart_signal(
    store: &dyn QueueStore,
    keys: &QueueKeys,
    at: i64,
    ttl: Duration,
) -> QueueResult<i64> {
    match store
        .execute_atomic(Transition::RaiseSignal {
            key: &keys.restart,
            at,
            ttl,
        })
        .await?
    {
        TransitionOutcome::Signalled(value) => Ok(value),
        other => Err(unexpected("raise_restart_signal", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::job::JobRecord;
    use crate::store::MemoryStore;

    fn encoded(id: &str) -> String {
        let mut record = JobRecord::new("task", "payload");
        record.id = id.to_string();
        codec::encode(&record).unwrap()
    }

    #[tokio::test]
    async fn test_push_then_pop_reserves() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t");
        let job = encoded("1");

        push(&store, &keys, &job).await.unwrap();
        assert_eq!(store.list_snapshot(&keys.notify).len(), 1);

        let reservation = pop(&store, &keys, 500).await.unwrap().unwrap();

        assert_eq!(reservation.job, job);
        assert!(store.list_snapshot(&keys.main).is_empty());
        assert!(store.list_snapshot(&keys.notify).is_empty());
        assert_eq!(
            store.sorted_set_snapshot(&keys.reserved),
            vec![(500, reservation.token.clone())]
        );
        assert_eq!(codec::decode(&reservation.token).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_pop_empty() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t");
        assert_eq!(pop(&store, &keys, 500).await.unwrap(), None);
        assert!(store.sorted_set_snapshot(&keys.reserved).is_empty());
    }

    #[tokio::test]
    async fn test_pop_reserves_corrupt_record_unchanged() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t");

        push(&store, &keys, "{broken").await.unwrap();
        let reservation = pop(&store, &keys, 10).await.unwrap().unwrap();

        assert_eq!(reservation.job, "{broken");
        assert_eq!(reservation.token, "{broken");
    }

    #[tokio::test]
    async fn test_expired_reservation_migrates_back() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t");
        push(&store, &keys, &encoded("1")).await.unwrap();
        let reservation = pop(&store, &keys, 100).await.unwrap().unwrap();

        assert_eq!(migrate_matured(&store, &keys, &keys.reserved, 99).await.unwrap(), 0);
        assert_eq!(migrate_matured(&store, &keys, &keys.reserved, 100).await.unwrap(), 1);

        assert_eq!(store.list_snapshot(&keys.main), vec![reservation.token]);
        assert!(store.sorted_set_snapshot(&keys.reserved).is_empty());
    }

    #[tokio::test]
    async fn test_repost_after_expiry_does_not_duplicate() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t");
        push(&store, &keys, &encoded("1")).await.unwrap();
        let reservation = pop(&store, &keys, 100).await.unwrap().unwrap();

        migrate_matured(&store, &keys, &keys.reserved, 200).await.unwrap();
        let moved = repost_reserved(&store, &keys, &reservation.token, 300)
            .await
            .unwrap();

        assert!(!moved);
        assert!(store.sorted_set_snapshot(&keys.delayed).is_empty());
        assert_eq!(store.list_snapshot(&keys.main).len(), 1);
    }

    #[tokio::test]
    async fn test_repost_moves_to_delayed() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t");
        push(&store, &keys, &encoded("1")).await.unwrap();
        let reservation = pop(&store, &keys, 100).await.unwrap().unwrap();

        assert!(
            repost_reserved(&store, &keys, &reservation.token, 150)
                .await
                .unwrap()
        );
        assert_eq!(
            store.sorted_set_snapshot(&keys.delayed),
            vec![(150, reservation.token)]
        );
        assert!(store.sorted_set_snapshot(&keys.reserved).is_empty());
    }

    #[tokio::test]
    async fn test_restart_signal_never_lowers() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t");
        let ttl = Duration::from_secs(60);

        assert_eq!(raise_restart_signal(&store, &keys, 5_000, ttl).await.unwrap(), 5_000);
        assert_eq!(raise_restart_signal(&store, &keys, 4_000, ttl).await.unwrap(), 5_000);
        assert_eq!(store.get(&keys.restart).await.unwrap().as_deref(), Some("5000"));
    }
}
