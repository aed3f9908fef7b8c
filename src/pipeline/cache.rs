//! Per-service response cache
//!
//! Entries expire after their TTL and the least recently used entry is shed
//! when the cache is full. `cached_call` additionally de-duplicates
//! concurrent producers for the same key: while one caller is fetching,
//! others with the same key wait for its outcome.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::{Result, WorkspaceError};

/// Hit/miss counters and current size of a cache
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub hit_rate: f64,
}

struct CacheEntry {
    value: Value,
    inserted_at: Instant,
    ttl: Duration,
    last_used: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

type FlightOutcome = Option<std::result::Result<Value, WorkspaceError>>;

/// Response cache for one named service
pub struct ResponseCache {
    service: String,
    config: CacheConfig,
    state: Mutex<CacheState>,
    in_flight: parking_lot::Mutex<HashMap<String, watch::Receiver<FlightOutcome>>>,
}

enum Role {
    Leader(watch::Sender<FlightOutcome>),
    Follower(watch::Receiver<FlightOutcome>),
}

/// Removes the in-flight marker when the leader finishes or is dropped
struct FlightGuard<'a> {
    cache: &'a ResponseCache,
    key: &'a str,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.cache.in_flight.lock().remove(self.key);
    }
}

impl ResponseCache {
    pub fn new(service: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(CacheState::default()),
            in_flight: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Get an unexpired value
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let tick = state.next_tick();

        let fresh = match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_used = tick;
                Some(entry.value.clone())
            }
            Some(_) => {
                state.entries.remove(key);
                None
            }
            None => None,
        };

        match fresh {
            Some(value) => {
                state.hits += 1;
                debug!(service = %self.service, key, "Cache hit");
                Some(value)
            }
            None => {
                state.misses += 1;
                debug!(service = %self.service, key, "Cache miss");
                None
            }
        }
    }

    /// Unexpired value without touching the counters
    async fn peek(&self, key: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.value.clone())
    }

    /// Store a value, using the default TTL when none is given
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let tick = state.next_tick();

        if !state.entries.contains_key(key) {
            // Expired entries go first, then least recently used
            let before = state.entries.len();
            state.entries.retain(|_, entry| !entry.is_expired(now));
            state.evictions += (before - state.entries.len()) as u64;

            if state.entries.len() >= self.config.max_size {
                let lru = state
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(k, _)| k.clone());
                if let Some(lru) = lru {
                    state.entries.remove(&lru);
                    state.evictions += 1;
                    debug!(service = %self.service, key = %lru, "Evicted least recently used entry");
                }
            }
        }

        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: now,
                ttl: ttl.unwrap_or(self.config.default_ttl),
                last_used: tick,
            },
        );
        debug!(service = %self.service, key, "Cached value");
    }

    /// Remove a key, returning whether it existed
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.state.lock().await.entries.remove(key).is_some();
        if removed {
            debug!(service = %self.service, key, "Deleted cache key");
        }
        removed
    }

    /// Remove every key starting with `prefix`, returning how many went
    pub async fn delete_prefix(&self, prefix: &str) -> usize {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(service = %self.service, prefix, removed, "Deleted cache keys by prefix");
        }
        removed
    }

    /// Drop every entry (counters are kept)
    pub async fn clear(&self) {
        self.state.lock().await.entries.clear();
        info!(service = %self.service, "Cache cleared");
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let total = state.hits + state.misses;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            size: state.entries.len(),
            hit_rate: if total > 0 {
                state.hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Return the cached value for `key`, or run `producer` and cache its
    /// successful result.
    ///
    /// `producer` never runs when a fresh entry exists, and never runs twice
    /// concurrently for the same key. Failures are returned uncached.
    pub async fn cached_call<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let mut producer = Some(producer);

        loop {
            if let Some(value) = self.get(key).await {
                return Ok(value);
            }

            let role = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get(key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        in_flight.insert(key.to_string(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Follower(mut rx) => {
                    debug!(service = %self.service, key, "Waiting on in-flight call");
                    let outcome = {
                        let waited = rx.wait_for(Option::is_some).await;
                        match waited {
                            Ok(outcome) => match &*outcome {
                                Some(Ok(value)) => Some(Ok(value.clone())),
                                Some(Err(err)) => Some(Err(err.clone())),
                                None => None,
                            },
                            // Leader dropped without an outcome; take over
                            Err(_) => None,
                        }
                    };
                    match outcome {
                        Some(Ok(value)) => return Ok(value),
                        Some(Err(err)) => return Err(err),
                        None => continue,
                    }
                }
                Role::Leader(tx) => {
                    let _guard = FlightGuard { cache: self, key };
                    // A previous leader may have filled the entry after our miss
                    if let Some(value) = self.peek(key).await {
                        return Ok(value);
                    }
                    let Some(producer) = producer.take() else {
                        return Err(WorkspaceError::unexpected(format!(
                            "Producer for {} already consumed",
                            key
                        )));
                    };
                    let result = producer().await;
                    match &result {
                        Ok(value) => {
                            self.set(key, value.clone(), ttl).await;
                            tx.send_replace(Some(Ok(value.clone())));
                        }
                        Err(err) => {
                            tx.send_replace(Some(Err(err.clone())));
                        }
                    }
                    return result;
                }
            }
        }
    }
}

/// Build a deterministic cache key.
///
/// Positional arguments keep their order; keyword arguments are sorted by
/// name and rendered as `name=value`. Segments are joined with `:`, and any
/// `%` or `:` inside a segment is percent-encoded, so distinct argument
/// lists never produce the same key and `"<op>:<arg>:"` is a safe prefix
/// for every key built from those leading arguments.
pub fn cache_key(operation: &str, positional: &[&(dyn ToString + Sync)], keyword: &[(&str, &(dyn ToString + Sync))]) -> String {
    let mut parts = Vec::with_capacity(1 + positional.len() + keyword.len());
    parts.push(escape_segment(operation));
    parts.extend(positional.iter().map(|arg| escape_segment(&arg.to_string())));

    let mut named: Vec<(&str, String)> = keyword
        .iter()
        .map(|(name, value)| (*name, value.to_string()))
        .collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    parts.extend(
        named
            .into_iter()
            .map(|(name, value)| format!("{}={}", escape_segment(name), escape_segment(&value))),
    );

    parts.join(":")
}

/// Prefix shared by every key built from `operation` and these leading
/// positional arguments
pub fn key_prefix(operation: &str, positional: &[&(dyn ToString + Sync)]) -> String {
    format!("{}:", cache_key(operation, positional, &[]))
}

fn escape_segment(raw: &str) -> String {
    if !raw.contains(|c| c == '%' || c == ':') {
        return raw.to_string();
    }
    raw.replace('%', "%25").replace(':', "%3A")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cache(max_size: usize) -> ResponseCache {
        ResponseCache::new(
            "drive",
            CacheConfig {
                max_size,
                default_ttl: Duration::from_secs(300),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_after_ttl_is_miss() {
        let cache = cache(10);
        cache.set("k", json!(1), Some(Duration::from_secs(5))).await;
        assert_eq!(cache.get("k").await, Some(json!(1)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("k").await, None);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
        assert_eq!(stats.evictions, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_counts() {
        let cache = cache(2);
        cache.set("a", json!("a"), None).await;
        cache.set("b", json!("b"), None).await;
        // Touch "a" so "b" becomes least recently used
        cache.get("a").await;
        cache.set("c", json!("c"), None).await;

        assert!(cache.get("b").await.is_none());
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_overwrite_is_not_eviction() {
        let cache = cache(1);
        cache.set("a", json!(1), None).await;
        cache.set("a", json!(2), None).await;
        assert_eq!(cache.get("a").await, Some(json!(2)));
        assert_eq!(cache.stats().await.evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_purged_on_insert() {
        let cache = cache(10);
        cache.set("old", json!(1), Some(Duration::from_secs(1))).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.set("new", json!(2), None).await;
        let stats = cache.stats().await;
        assert_eq!(stats.size, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = cache(10);
        cache.set("a", json!(1), None).await;
        cache.set("b", json!(2), None).await;
        assert!(cache.delete("a").await);
        assert!(!cache.delete("a").await);
        cache.clear().await;
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let cache = cache(10);
        cache.set(&cache_key("read", &[&"f1", &""], &[]), json!(1), None).await;
        cache.set(&cache_key("read", &[&"f1", &"text/plain"], &[]), json!(2), None).await;
        cache.set(&cache_key("read", &[&"f10", &""], &[]), json!(3), None).await;

        let prefix = format!("{}:", cache_key("read", &[&"f1"], &[]));
        assert_eq!(cache.delete_prefix(&prefix).await, 2);
        assert_eq!(cache.stats().await.size, 1);
        assert!(cache.get(&cache_key("read", &[&"f10", &""], &[])).await.is_some());
        assert_eq!(cache.delete_prefix(&prefix).await, 0);
    }

    #[tokio::test]
    async fn test_hit_rate() {
        let cache = cache(10);
        cache.set("a", json!(1), None).await;
        cache.get("a").await;
        cache.get("a").await;
        cache.get("a").await;
        cache.get("missing").await;
        let stats = cache.stats().await;
        assert_eq!(stats.hit_rate, 0.75);
    }

    #[tokio::test]
    async fn test_cached_call_does_not_cache_errors() {
        let cache = cache(10);
        let calls = AtomicUsize::new(0);

        let err = cache
            .cached_call("k", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(WorkspaceError::not_found("gone"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert_eq!(cache.stats().await.size, 0);

        let value = cache
            .cached_call("k", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!("ok"))
            })
            .await
            .unwrap();
        assert_eq!(value, json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_producer() {
        let cache = Arc::new(cache(10));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .cached_call("search:foo", None, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!(["foo.txt"]))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!(["foo.txt"]));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_writes_nothing() {
        let cache = cache(10);
        let result = tokio::time::timeout(
            Duration::from_millis(10),
            cache.cached_call("slow", None, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(1))
            }),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(cache.stats().await.size, 0);

        // The flight marker is gone, so a new call runs its own producer
        let value = cache
            .cached_call("slow", None, || async { Ok(json!(2)) })
            .await
            .unwrap();
        assert_eq!(value, json!(2));
    }

    #[test]
    fn test_cache_key_ordering() {
        let a = cache_key("gmail_search", &[&"foo", &10], &[("labels", &"INBOX"), ("after", &"2024")]);
        let b = cache_key("gmail_search", &[&"foo", &10], &[("after", &"2024"), ("labels", &"INBOX")]);
        assert_eq!(a, b);
        assert_eq!(a, "gmail_search:foo:10:after=2024:labels=INBOX");

        let swapped = cache_key("gmail_search", &[&10, &"foo"], &[]);
        assert_ne!(cache_key("gmail_search", &[&"foo", &10], &[]), swapped);
    }

    #[test]
    fn test_cache_key_separators_in_arguments() {
        // "a:b" + "c" must not collide with "a" + "b:c"
        let left = cache_key("read", &[&"a:b", &"c"], &[]);
        let right = cache_key("read", &[&"a", &"b:c"], &[]);
        assert_ne!(left, right);
        assert_eq!(left, "read:a%3Ab:c");
        assert_eq!(right, "read:a:b%3Ac");

        // Already-encoded text stays distinct from the raw separator
        assert_ne!(cache_key("read", &[&"a%3Ab"], &[]), cache_key("read", &[&"a:b"], &[]));
        assert_eq!(
            cache_key("sheets_read", &[&"id"], &[("range", &"Sheet1!A1:B2")]),
            "sheets_read:id:range=Sheet1!A1%3AB2"
        );
    }
}
