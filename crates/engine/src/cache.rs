//! Best-effort secondary tier over the system of record. Values here are
//! derived and disposable; nothing reads the cache as authoritative state.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Cache key builders. One namespace per cached shape so invalidation can
/// target raw entities and assembled configurations independently.
pub mod keys {
    use persona_core::domain::agent::AgentConfigId;
    use persona_core::domain::template::TemplateId;

    pub fn template(id: &TemplateId) -> String {
        format!("template:{}", id.0)
    }

    pub fn profile(agent_config_id: &AgentConfigId) -> String {
        format!("profile:{}", agent_config_id.0)
    }

    pub fn effective(agent_config_id: &AgentConfigId) -> String {
        format!("effective:{}", agent_config_id.0)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache operation exceeded its {0:?} budget")]
    Timeout(Duration),
}

/// Storage-agnostic cache seam. Values are JSON so one implementation serves
/// every cached shape.
#[async_trait]
pub trait ConfigCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError>;
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), CacheError>;
    async fn invalidate(&self, key: &str) -> Result<(), CacheError>;
}

/// Bound a single cache operation. A slow cache degrades to the store; it
/// must never stall the caller.
pub async fn guarded<T, F>(budget: Duration, operation: F) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>> + Send,
{
    match tokio::time::timeout(budget, operation).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout(budget)),
    }
}

struct CachedValue {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Process-local cache with per-entry TTL. Expired entries are treated as
/// misses and overwritten on the next put.
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, CachedValue>>,
}

#[async_trait]
impl ConfigCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), CachedValue { value, expires_at: Instant::now() + ttl });
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// For deployments without a cache tier; every read is a miss.
pub struct NoopCache;

#[async_trait]
impl ConfigCache for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<serde_json::Value>, CacheError> {
        Ok(None)
    }

    async fn put(
        &self,
        _key: &str,
        _value: serde_json::Value,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    async fn invalidate(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{guarded, CacheError, ConfigCache, InMemoryCache, NoopCache};

    #[tokio::test]
    async fn hit_within_ttl_then_miss_after_expiry() {
        tokio::time::pause();
        let cache = InMemoryCache::default();

        cache
            .put("template:tpl-1", serde_json::json!({"name": "role"}), Duration::from_secs(60))
            .await
            .expect("put");
        assert!(cache.get("template:tpl-1").await.expect("get").is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("template:tpl-1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn invalidating_an_absent_key_is_a_no_op() {
        let cache = InMemoryCache::default();
        cache.invalidate("effective:ghost").await.expect("invalidate");
        cache.invalidate("effective:ghost").await.expect("invalidate twice");
    }

    #[tokio::test]
    async fn noop_cache_never_hits() {
        let cache = NoopCache;
        cache
            .put("template:tpl-1", serde_json::json!(1), Duration::from_secs(60))
            .await
            .expect("put");
        assert!(cache.get("template:tpl-1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn guard_cuts_off_a_stalled_operation() {
        let stalled = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(serde_json::json!(null))
        };
        let result = guarded(Duration::from_millis(50), stalled).await;
        assert!(matches!(result, Err(CacheError::Timeout(_))));
    }
}
