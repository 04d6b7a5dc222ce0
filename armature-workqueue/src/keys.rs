//! Store key layout for a queue.

/// Default namespace for queue keys.
pub const DEFAULT_KEY_PREFIX: &str = "queues";

/// The keys a single queue owns.
///
/// Deployed workers assume these names, so changing the layout needs a
/// migration of live data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// Ready list
    pub main: String,
    /// Wake-up list for blocked consumers
    pub notify: String,
    /// Jobs waiting for their maturity time
    pub delayed: String,
    /// Jobs checked out by a consumer
    pub reserved: String,
    /// Worker restart timestamp
    pub restart: String,
    /// Encoded failure records
    pub failed: String,
    /// Raw strings that failed to decode
    pub quarantine: String,
}

impl QueueKeys {
    /// Keys for `queue_name` under the default prefix.
    pub fn new(queue_name: &str) -> Self {
        Self::with_prefix(DEFAULT_KEY_PREFIX, queue_name)
    }

    /// Keys for `queue_name` under `prefix`.
    pub fn with_prefix(prefix: &str, queue_name: &str) -> Self {
        let main = format!("{}:{}", prefix, queue_name);
        Self {
            notify: format!("{}:notify", main),
            delayed: format!("{}:delayed", main),
            reserved: format!("{}:reserved", main),
            restart: format!("{}:restart", main),
            failed: format!("{}:failed", main),
            quarantine: format!("{}:quarantine", main),
            main,
        }
    }

    /// Every key, for bulk deletion.
    pub fn all(&self) -> Vec<String> {
        vec![
            self.main.clone(),
            self.notify.clone(),
            self.delayed.clone(),
            self.reserved.clone(),
            self.restart.clone(),
            self.failed.clone(),
            self.quarantine.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("emails");

        assert_eq!(keys.main, "queues:emails");
        assert_eq!(keys.notify, "queues:emails:notify");
        assert_eq!(keys.delayed, "queues:emails:delayed");
        assert_eq!(keys.reserved, "queues:emails:reserved");
        assert_eq!(keys.restart, "queues:emails:restart");
        assert_eq!(keys.failed, "queues:emails:failed");
        assert_eq!(keys.quarantine, "queues:emails:quarantine");
    }

    #[test]
    fn test_custom_prefix() {
        let keys = QueueKeys::with_prefix("myapp:queues", "default");
        assert_eq!(keys.main, "myapp:queues:default");
        assert_eq!(keys.reserved, "myapp:queues:default:reserved");
    }

    #[test]
    fn test_different_queues_do_not_collide() {
        let a = QueueKeys::new("a");
        let b = QueueKeys::new("b");
        for key in a.all() {
            assert!(!b.all().contains(&key));
        }
    }

    #[test]
    fn test_all_keys_distinct() {
        let mut keys = QueueKeys::new("q").all();
        let total = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), total);
    }
}
