use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use supervisor_core::model::CommandResult;

/// In-memory LRU cache of credential-push results, keyed by
/// `idempotency_key`. This backs only the credential-push shortcut on the
/// external admin surface — the durable, SHA-256-keyed idempotency table
/// used by `CommandDispatcher` is unrelated and lives in the durable store
/// instead.
pub struct CredentialPushCache {
    cache: Mutex<LruCache<String, CommandResult>>,
}

impl CredentialPushCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
        }
    }

    pub fn lookup(&self, idempotency_key: &str) -> Option<CommandResult> {
        self.cache.lock().get(idempotency_key).cloned()
    }

    pub fn record(&self, idempotency_key: String, result: CommandResult) {
        self.cache.lock().put(idempotency_key, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use supervisor_core::model::CommandStatus;

    #[test]
    fn caches_and_evicts_fifo() {
        let cache = CredentialPushCache::new(2);
        let r = |id: &str| CommandResult {
            command_id: id.into(),
            status: CommandStatus::Success,
            output: None,
            error: None,
            timestamp: Utc::now(),
        };
        cache.record("a".into(), r("1"));
        cache.record("b".into(), r("2"));
        cache.record("c".into(), r("3"));
        assert!(cache.lookup("a").is_none());
        assert!(cache.lookup("b").is_some());
        assert!(cache.lookup("c").is_some());
    }
}
