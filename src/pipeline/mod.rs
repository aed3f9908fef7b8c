//! Request-execution pipeline
//!
//! Every service adapter call funnels through [`Pipeline::execute`], which
//! composes the per-service [`RateLimiter`], the per-service
//! [`ResponseCache`] and error translation into a single contract.

pub mod cache;
pub mod rate_limiter;
pub mod translate;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::{CacheConfig, RateLimitConfig};
use crate::error::{Result, WorkspaceError};

pub use cache::{cache_key, key_prefix, CacheStats, ResponseCache};
pub use rate_limiter::{RateLimitStats, RateLimiter};
pub use translate::{with_error_handling, ApiError};

/// TTL for data that changes often (search results, form responses)
pub const VOLATILE_TTL: Duration = Duration::from_secs(60);

/// Owner of the per-service limiters and caches.
///
/// Instances are created lazily on first use of a service name and live as
/// long as the registry.
pub struct Registry {
    rate_limit: RateLimitConfig,
    cache: CacheConfig,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
    caches: RwLock<HashMap<String, Arc<ResponseCache>>>,
}

impl Registry {
    pub fn new(rate_limit: RateLimitConfig, cache: CacheConfig) -> Self {
        Self {
            rate_limit,
            cache,
            limiters: RwLock::new(HashMap::new()),
            caches: RwLock::new(HashMap::new()),
        }
    }

    /// Limiter for `service`, created on first use
    pub fn rate_limiter(&self, service: &str) -> Arc<RateLimiter> {
        if let Some(limiter) = self.limiters.read().get(service) {
            return limiter.clone();
        }
        self.limiters
            .write()
            .entry(service.to_string())
            .or_insert_with(|| {
                debug!(service, "Creating rate limiter");
                Arc::new(RateLimiter::new(service, self.rate_limit))
            })
            .clone()
    }

    /// Cache for `service`, created on first use
    pub fn cache(&self, service: &str) -> Arc<ResponseCache> {
        if let Some(cache) = self.caches.read().get(service) {
            return cache.clone();
        }
        self.caches
            .write()
            .entry(service.to_string())
            .or_insert_with(|| {
                debug!(service, "Creating response cache");
                Arc::new(ResponseCache::new(service, self.cache))
            })
            .clone()
    }

    /// Stats for `service`'s cache (zeroed if it was never used)
    pub async fn cache_stats(&self, service: &str) -> CacheStats {
        self.cache(service).stats().await
    }

    /// Names of services that have a cache, sorted
    pub fn cached_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RateLimitConfig::default(), CacheConfig::default())
    }
}

/// The composed "execute remote operation" primitive
#[derive(Clone)]
pub struct Pipeline {
    registry: Arc<Registry>,
}

impl Pipeline {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run `thunk` against `service`.
    ///
    /// Read-only calls with a key are served from the cache when fresh; on a
    /// miss the limiter is acquired and `thunk` runs (at most once per key at
    /// a time). Other calls acquire the limiter and run `thunk` uncached.
    /// Every failure leaves as a translated [`WorkspaceError`].
    pub async fn execute<T, F, Fut>(
        &self,
        service: &str,
        operation_key: Option<&str>,
        read_only: bool,
        ttl: Option<Duration>,
        thunk: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let limiter = self.registry.rate_limiter(service);
        let operation = operation_name(service, operation_key);
        let operation = operation.as_str();

        match operation_key {
            Some(key) if read_only => {
                let cache = self.registry.cache(service);
                let value = cache
                    .cached_call(key, ttl, move || async move {
                        limiter.acquire().await?;
                        let result = with_error_handling(operation, thunk()).await?;
                        Ok::<_, WorkspaceError>(serde_json::to_value(result)?)
                    })
                    .await?;
                serde_json::from_value(value).map_err(|err| {
                    WorkspaceError::unexpected(format!(
                        "Cached value for {} has an unexpected shape",
                        operation
                    ))
                    .with_cause(err)
                })
            }
            _ => {
                limiter.acquire().await?;
                with_error_handling(operation, thunk()).await
            }
        }
    }

    /// Cached, rate-limited read
    pub async fn read<T, F, Fut>(
        &self,
        service: &str,
        key: &str,
        ttl: Option<Duration>,
        thunk: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute(service, Some(key), true, ttl, thunk).await
    }

    /// Rate-limited mutation; never cached
    pub async fn write<T, F, Fut>(&self, service: &str, operation: &str, thunk: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute(service, Some(operation), false, None, thunk).await
    }

    /// Drop a cached read, e.g. after a mutation of the same resource
    pub async fn invalidate(&self, service: &str, key: &str) -> bool {
        self.registry.cache(service).delete(key).await
    }

    /// Drop every cached read whose key starts with `prefix`
    pub async fn invalidate_prefix(&self, service: &str, prefix: &str) -> usize {
        self.registry.cache(service).delete_prefix(prefix).await
    }

    /// Take one admission from `service`'s limiter.
    ///
    /// For thunks that issue more than one remote request: `execute` admits
    /// the first, and each further request acquires here before it is sent.
    pub async fn acquire(&self, service: &str) -> Result<()> {
        self.registry.rate_limiter(service).acquire().await
    }

    pub async fn cache_stats(&self, service: &str) -> CacheStats {
        self.registry.cache_stats(service).await
    }

    pub async fn rate_stats(&self, service: &str) -> RateLimitStats {
        self.registry.rate_limiter(service).stats().await
    }
}

/// Operation label for logs: the key's leading segment, or the service
fn operation_name(service: &str, operation_key: Option<&str>) -> String {
    match operation_key.and_then(|key| key.split(':').next()) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("{} call", service),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_reuses_instances() {
        let registry = Registry::default();
        let a = registry.rate_limiter("drive");
        let b = registry.rate_limiter("drive");
        let c = registry.rate_limiter("gmail");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let x = registry.cache("drive");
        let y = registry.cache("drive");
        assert!(Arc::ptr_eq(&x, &y));
        assert_eq!(registry.cached_services(), vec!["drive".to_string()]);
    }

    #[test]
    fn test_operation_name() {
        assert_eq!(operation_name("drive", Some("search:foo:10")), "search");
        assert_eq!(operation_name("gmail", None), "gmail call");
    }
}
