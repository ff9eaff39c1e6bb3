//! Key-value store seam.
//!
//! The engine persists four things: confidence adjustments, per-conversation
//! state, experiment assignments and outcome counters (plus feedback stats
//! and the feedback log). Backends implement [`KvStore`]; every mutating
//! operation is atomic for its key, so concurrent writers never lose an
//! update. [`GuardedStore`] wraps a backend with the per-call timeout and
//! the fallback bookkeeping the engine relies on.

pub mod cache;
pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::telemetry::MorphMetrics;

pub use cache::LocalCache;
pub use memory::InMemoryStore;

/// Abstract Redis-like store.
///
/// Values are strings; numeric operations parse and format them.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Write `value` only if `key` is absent. Returns the value stored after
    /// the call, i.e. the first writer's value.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<String, StoreError>;

    /// Atomically add `delta` to an integer counter (missing = 0).
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Atomically add `delta` to a float, clamping the result to
    /// `[min, max]` (missing = 0). Returns the new value.
    async fn incr_float_clamped(
        &self,
        key: &str,
        delta: f64,
        min: f64,
        max: f64,
    ) -> Result<f64, StoreError>;

    /// Push to the front of a list and trim it to `max_len` entries.
    async fn push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError>;

    /// Up to `limit` entries from the front of a list.
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Atomically add `delta` to `member`'s score in a ranked set.
    async fn zincr(&self, key: &str, member: &str, delta: f64) -> Result<f64, StoreError>;

    /// Up to `limit` members of a ranked set, highest score first.
    async fn ztop(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Per-operation bound.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Prefix for every key.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Bound on each process-local cache (conversation state, assignments).
    #[serde(default = "default_local_cache_size")]
    pub local_cache_size: usize,
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_namespace() -> String {
    "morphing".to_string()
}

fn default_local_cache_size() -> usize {
    cache::DEFAULT_CAPACITY
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            namespace: default_namespace(),
            local_cache_size: default_local_cache_size(),
        }
    }
}

/// Key layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn adjustment(&self, persona_id: &str, signal: &str) -> String {
        format!("{}:adjust:{}:{}", self.namespace, persona_id, signal)
    }

    pub fn conversation(&self, conversation_id: &str) -> String {
        format!("{}:conv:{}", self.namespace, conversation_id)
    }

    pub fn assignment(&self, experiment_id: &str, subject_id: &str) -> String {
        format!("{}:exp:assign:{}:{}", self.namespace, experiment_id, subject_id)
    }

    pub fn outcome(&self, experiment_id: &str, variant: usize, counter: &str) -> String {
        format!("{}:exp:count:{}:{}:{}", self.namespace, experiment_id, variant, counter)
    }

    pub fn persona_stat(&self, persona_id: &str, counter: &str) -> String {
        format!("{}:stats:{}:{}", self.namespace, persona_id, counter)
    }

    pub fn feedback_log(&self) -> String {
        format!("{}:feedback:log", self.namespace)
    }

    /// Ranked `persona:signal` patterns for one verdict.
    pub fn patterns(&self, outcome: &str) -> String {
        format!("{}:patterns:{}", self.namespace, outcome)
    }
}

/// A [`KvStore`] behind a timeout.
///
/// Every failure or timeout is logged and counted as a store fallback; the
/// caller then substitutes its stateless default.
#[derive(Clone)]
pub struct GuardedStore {
    inner: Arc<dyn KvStore>,
    timeout: Duration,
    keys: Keys,
    local_cache_size: usize,
    metrics: Arc<MorphMetrics>,
}

impl std::fmt::Debug for GuardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedStore")
            .field("timeout", &self.timeout)
            .field("keys", &self.keys)
            .finish()
    }
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn KvStore>, config: &StoreConfig, metrics: Arc<MorphMetrics>) -> Self {
        Self {
            inner,
            timeout: Duration::from_millis(config.timeout_ms),
            keys: Keys::new(config.namespace.clone()),
            local_cache_size: config.local_cache_size,
            metrics,
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Capacity for caches kept in front of this store.
    pub fn local_cache_size(&self) -> usize {
        self.local_cache_size
    }

    async fn guarded<T, F>(&self, op: &str, key: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(StoreError::Timeout {
                op: op.to_string(),
                millis: self.timeout.as_millis() as u64,
            }),
        };
        if let Err(e) = &result {
            log::warn!("Store {} on '{}' failed, falling back: {}", op, key, e);
            self.metrics.record_store_fallback();
        }
        result
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.guarded("get", key, self.inner.get(key)).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.guarded("set", key, self.inner.set(key, value)).await
    }

    pub async fn set_if_absent(&self, key: &str, value: &str) -> Result<String, StoreError> {
        self.guarded("set_if_absent", key, self.inner.set_if_absent(key, value))
            .await
    }

    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.guarded("incr", key, self.inner.incr(key, delta)).await
    }

    pub async fn incr_float_clamped(
        &self,
        key: &str,
        delta: f64,
        min: f64,
        max: f64,
    ) -> Result<f64, StoreError> {
        self.guarded(
            "incr_float",
            key,
            self.inner.incr_float_clamped(key, delta, min, max),
        )
        .await
    }

    pub async fn push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
        self.guarded("push", key, self.inner.push_trim(key, value, max_len))
            .await
    }

    pub async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        self.guarded("list_range", key, self.inner.list_range(key, limit))
            .await
    }

    pub async fn zincr(&self, key: &str, member: &str, delta: f64) -> Result<f64, StoreError> {
        self.guarded("zincr", key, self.inner.zincr(key, member, delta)).await
    }

    pub async fn ztop(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, StoreError> {
        self.guarded("ztop", key, self.inner.ztop(key, limit)).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.guarded("delete", key, self.inner.delete(key)).await
    }

    /// Float value at `key`; `0.0` when absent, unreadable or unavailable.
    pub async fn get_float(&self, key: &str) -> f64 {
        match self.get(key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|_| {
                log::warn!("Non-numeric value at '{}': {}", key, raw);
                0.0
            }),
            _ => 0.0,
        }
    }

    /// Integer value at `key`; `0` when absent, unreadable or unavailable.
    pub async fn get_int(&self, key: &str) -> i64 {
        match self.get(key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|_| {
                log::warn!("Non-integer value at '{}': {}", key, raw);
                0
            }),
            _ => 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Store doubles for degraded-mode tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Every call fails.
    #[derive(Debug, Default)]
    pub struct FailingStore;

    fn down() -> StoreError {
        StoreError::Unavailable("connection refused".into())
    }

    #[async_trait]
    impl KvStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(down())
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(down())
        }
        async fn set_if_absent(&self, _key: &str, _value: &str) -> Result<String, StoreError> {
            Err(down())
        }
        async fn incr(&self, _key: &str, _delta: i64) -> Result<i64, StoreError> {
            Err(down())
        }
        async fn incr_float_clamped(&self, _key: &str, _d: f64, _min: f64, _max: f64) -> Result<f64, StoreError> {
            Err(down())
        }
        async fn push_trim(&self, _key: &str, _value: &str, _max_len: usize) -> Result<(), StoreError> {
            Err(down())
        }
        async fn list_range(&self, _key: &str, _limit: usize) -> Result<Vec<String>, StoreError> {
            Err(down())
        }
        async fn zincr(&self, _key: &str, _member: &str, _delta: f64) -> Result<f64, StoreError> {
            Err(down())
        }
        async fn ztop(&self, _key: &str, _limit: usize) -> Result<Vec<(String, f64)>, StoreError> {
            Err(down())
        }
        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(down())
        }
    }

    /// Delays every call past any reasonable timeout, then delegates.
    #[derive(Debug, Default)]
    pub struct SlowStore {
        pub inner: InMemoryStore,
        pub delay: Duration,
    }

    #[async_trait]
    impl KvStore for SlowStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.set(key, value).await
        }
        async fn set_if_absent(&self, key: &str, value: &str) -> Result<String, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.set_if_absent(key, value).await
        }
        async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.incr(key, delta).await
        }
        async fn incr_float_clamped(&self, key: &str, d: f64, min: f64, max: f64) -> Result<f64, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.incr_float_clamped(key, d, min, max).await
        }
        async fn push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.push_trim(key, value, max_len).await
        }
        async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.list_range(key, limit).await
        }
        async fn zincr(&self, key: &str, member: &str, delta: f64) -> Result<f64, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.zincr(key, member, delta).await
        }
        async fn ztop(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.ztop(key, limit).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.delete(key).await
        }
    }

    /// Delegates to memory, except that the `fail_on`-th `set` (1-based) on a
    /// key containing `key_part` fails once.
    #[derive(Debug, Default)]
    pub struct FlakySetStore {
        pub inner: InMemoryStore,
        pub key_part: String,
        pub fail_on: usize,
        pub sets: AtomicUsize,
    }

    impl FlakySetStore {
        pub fn new(key_part: &str, fail_on: usize) -> Self {
            Self {
                inner: InMemoryStore::new(),
                key_part: key_part.to_string(),
                fail_on,
                sets: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl KvStore for FlakySetStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            if key.contains(&self.key_part) && self.sets.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(down());
            }
            self.inner.set(key, value).await
        }
        async fn set_if_absent(&self, key: &str, value: &str) -> Result<String, StoreError> {
            self.inner.set_if_absent(key, value).await
        }
        async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
            self.inner.incr(key, delta).await
        }
        async fn incr_float_clamped(&self, key: &str, d: f64, min: f64, max: f64) -> Result<f64, StoreError> {
            self.inner.incr_float_clamped(key, d, min, max).await
        }
        async fn push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
            self.inner.push_trim(key, value, max_len).await
        }
        async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
            self.inner.list_range(key, limit).await
        }
        async fn zincr(&self, key: &str, member: &str, delta: f64) -> Result<f64, StoreError> {
            self.inner.zincr(key, member, delta).await
        }
        async fn ztop(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, StoreError> {
            self.inner.ztop(key, limit).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }
}
