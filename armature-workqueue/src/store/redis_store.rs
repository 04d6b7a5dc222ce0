//! Redis implementation of the queue store.

use super::{NOTIFY_SENTINEL, QueueStore, Reservation, Transition, TransitionOutcome};
use crate::config::StoreConfig;
use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use std::time::Duration;
use tracing::{debug, info};

const PUSH_LUA: &str = include_str!("lua/push.lua");
const POP_LUA: &str = include_str!("lua/pop.lua");
const MIGRATE_MATURED_LUA: &str = include_str!("lua/migrate_matured.lua");
const REPOST_RESERVED_LUA: &str = include_str!("lua/repost_reserved.lua");
const RAISE_SIGNAL_LUA: &str = include_str!("lua/raise_signal.lua");

/// Shortest BLPOP timeout sent to Redis. A timeout of zero blocks forever.
const MIN_BLOCK_TIMEOUT: Duration = Duration::from_millis(1);

/// BLPOP timeout in seconds, never rounded down to "forever".
fn block_timeout_secs(timeout: Duration) -> f64 {
    timeout.max(MIN_BLOCK_TIMEOUT).as_secs_f64()
}

/// Queue store backed by Redis lists, sorted sets and Lua scripts.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    push_script: Script,
    pop_script: Script,
    migrate_script: Script,
    repost_script: Script,
    raise_script: Script,
}

impl RedisStore {
    /// Connect using `config`.
    pub async fn connect(config: &StoreConfig) -> QueueResult<Self> {
        let client = Client::open(config.connection_url())
            .map_err(|e| QueueError::Config(e.to_string()))?;

        let mut connection = ConnectionManager::new(client.clone()).await?;

        if let Some(name) = &config.connection_name {
            let _: () = redis::cmd("CLIENT")
                .arg("SETNAME")
                .arg(name)
                .query_async(&mut connection)
                .await?;
        }

        info!(url = %config.url, "Queue store connected");
        Ok(Self::with_connection(client, connection))
    }

    /// Wrap an existing connection. `client` opens the dedicated
    /// connections used for blocking pops.
    pub fn with_connection(client: Client, connection: ConnectionManager) -> Self {
        Self {
            client,
            connection,
            push_script: Script::new(PUSH_LUA),
            pop_script: Script::new(POP_LUA),
            migrate_script: Script::new(MIGRATE_MATURED_LUA),
            repost_script: Script::new(REPOST_RESERVED_LUA),
            raise_script: Script::new(RAISE_SIGNAL_LUA),
        }
    }

    /// Get the underlying connection manager.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn list_push_back(&self, key: &str, value: &str) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn list_pop_front(&self, key: &str) -> QueueResult<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.lpop(key, None).await?;
        Ok(value)
    }

    async fn list_pop_front_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> QueueResult<Option<String>> {
        // BLPOP parks the whole multiplexed connection, so it gets its own.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> =
            conn.blpop(key, block_timeout_secs(timeout)).await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn list_len(&self, key: &str) -> QueueResult<usize> {
        let mut conn = self.connection.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn list_range(&self, key: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let values: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(values)
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn sorted_set_update(&self, key: &str, score: i64, member: &str) -> QueueResult<bool> {
        let mut conn = self.connection.clone();
        // XX keeps an acknowledged or migrated member from being re-added.
        let changed: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg("XX")
            .arg("CH")
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(changed > 0)
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> QueueResult<bool> {
        let mut conn = self.connection.clone();
        let removed: u32 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        max_score: i64,
    ) -> QueueResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = conn.zrangebyscore(key, "-inf", max_score).await?;
        Ok(members)
    }

    async fn sorted_set_len(&self, key: &str) -> QueueResult<usize> {
        let mut conn = self.connection.clone();
        let len: usize = conn.zcard(key).await?;
        Ok(len)
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> QueueResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = conn.del(keys.to_vec()).await?;
        Ok(())
    }

    async fn execute_atomic(&self, transition: Transition<'_>) -> QueueResult<TransitionOutcome> {
        let mut conn = self.connection.clone();
        debug!(op = transition.name(), "Running queue script");

        match transition {
            Transition::Push {
                main,
                notify,
                record,
            } => {
                let _: i64 = self
                    .push_script
                    .key(main)
                    .key(notify)
                    .arg(record)
                    .arg(NOTIFY_SENTINEL)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(TransitionOutcome::Pushed)
            }
            Transition::Pop {
                main,
                reserved,
                notify,
                visibility_deadline,
            } => {
                let (job, token): (Option<String>, Option<String>) = self
                    .pop_script
                    .key(main)
                    .key(reserved)
                    .key(notify)
                    .arg(visibility_deadline)
                    .invoke_async(&mut conn)
                    .await?;

                match (job, token) {
                    (Some(job), Some(token)) => {
                        Ok(TransitionOutcome::Popped(Some(Reservation { job, token })))
                    }
                    (None, None) => Ok(TransitionOutcome::Popped(None)),
                    _ => Err(QueueError::Store(
                        "pop script returned a job without a reservation".into(),
                    )),
                }
            }
            Transition::MigrateMatured {
                source,
                main,
                notify,
                now,
            } => {
                let moved: usize = self
                    .migrate_script
                    .key(source)
                    .key(main)
                    .key(notify)
                    .arg(now)
                    .arg(NOTIFY_SENTINEL)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(TransitionOutcome::Migrated(moved))
            }
            Transition::RepostReserved {
                delayed,
                reserved,
                member,
                matured_at,
            } => {
                let moved: i64 = self
                    .repost_script
                    .key(delayed)
                    .key(reserved)
                    .arg(member)
                    .arg(matured_at)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(TransitionOutcome::Reposted(moved == 1))
            }
            Transition::RaiseSignal { key, at, ttl } => {
                let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                let stored: String = self
                    .raise_script
                    .key(key)
                    .arg(at)
                    .arg(ttl_millis)
                    .invoke_async(&mut conn)
                    .await?;
                let value = stored
                    .parse::<i64>()
                    .map_err(|e| QueueError::corrupt(stored.clone(), e))?;
                Ok(TransitionOutcome::Signalled(value))
            }
        }
    }
}
