//! Store and queue configuration.

use crate::keys::{DEFAULT_KEY_PREFIX, QueueKeys};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings for the Redis backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL (redis://host:port or rediss://host:port for TLS).
    pub url: String,
    /// Database number.
    #[serde(default)]
    pub database: Option<u8>,
    /// Username for Redis 6+ ACL.
    #[serde(default)]
    pub username: Option<String>,
    /// Password.
    #[serde(default)]
    pub password: Option<String>,
    /// Connection name (for CLIENT SETNAME).
    #[serde(default)]
    pub connection_name: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            database: None,
            username: None,
            password: None,
            connection_name: None,
        }
    }
}

impl StoreConfig {
    /// Create a configuration for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Load settings from `REDIS_URL`, `REDIS_DATABASE`, `REDIS_USERNAME`
    /// and `REDIS_PASSWORD`, keeping defaults for anything unset.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("REDIS_URL") {
            config.url = url;
        }

        if let Some(db) = lookup("REDIS_DATABASE")
            && let Ok(db) = db.parse()
        {
            config.database = Some(db);
        }

        config.username = lookup("REDIS_USERNAME");
        config.password = lookup("REDIS_PASSWORD");
        config
    }

    /// Set the database number.
    pub fn with_database(mut self, database: u8) -> Self {
        self.database = Some(database);
        self
    }

    /// Set ACL credentials.
    pub fn with_credentials(
        mut self,
        username: Option<impl Into<String>>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.map(Into::into);
        self.password = Some(password.into());
        self
    }

    /// Set the client connection name.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// The URL with credentials and database folded in.
    pub fn connection_url(&self) -> String {
        let mut url = self.url.clone();

        if let Some(password) = &self.password {
            let auth = match &self.username {
                Some(username) => format!("{}:{}@", username, password),
                None => format!(":{}@", password),
            };
            for scheme in ["redis://", "rediss://"] {
                if let Some(rest) = url.strip_prefix(scheme) {
                    url = format!("{}{}{}", scheme, auth, rest);
                    break;
                }
            }
        }

        if let Some(db) = self.database {
            let authority_start = url.find("://").map(|i| i + 3).unwrap_or(0);
            if !url[authority_start..].contains('/') {
                url = format!("{}/{}", url, db);
            }
        }

        url
    }
}

/// Per-queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name
    pub queue_name: String,

    /// Namespace for the queue's keys
    pub key_prefix: String,

    /// Visibility timeout for jobs that do not set their own
    pub default_running_timeout: Duration,

    /// How long a worker's dequeue blocks waiting for work
    pub block_timeout: Duration,

    /// Lifetime of a restart signal
    pub restart_signal_ttl: Duration,
}

impl QueueConfig {
    /// Create a configuration for `queue_name`.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_running_timeout: Duration::from_secs(60),
            block_timeout: Duration::from_secs(5),
            restart_signal_ttl: Duration::from_secs(86400), // 24 hours
        }
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the default visibility timeout.
    pub fn with_default_running_timeout(mut self, timeout: Duration) -> Self {
        self.default_running_timeout = timeout;
        self
    }

    /// Set the worker dequeue block timeout.
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Set the restart signal lifetime.
    pub fn with_restart_signal_ttl(mut self, ttl: Duration) -> Self {
        self.restart_signal_ttl = ttl;
        self
    }

    /// Keys owned by this queue.
    pub fn keys(&self) -> QueueKeys {
        QueueKeys::with_prefix(&self.key_prefix, &self.queue_name)
    }
}
