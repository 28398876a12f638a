//! Content-addressed result cache in front of the analysis server.
//!
//! - Keys: SHA256 of method, path, position and the SHA256 of the source
//!   text, so any edit to the document misses
//! - Versioned entry envelope; entries of another version read as misses
//! - Backend access runs under its own circuit breaker; a failing backend
//!   degrades to "miss" on read and "skip" on write, never to an error

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use typelens_resilience::{BreakerConfig, CallError, CircuitBreaker};

use crate::config::CacheConfig;
use crate::query::DocumentQuery;

/// Current cache entry format version.
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Storage behind [`ResultCache`]. Values are opaque serialized entries.
pub trait CacheBackend: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
}

/// SHA256 of `text` as lowercase hex.
#[must_use]
pub fn content_hash(text: &str) -> String {
    hex_encode(&Sha256::digest(text.as_bytes()))
}

/// Derive the cache key for `method` at the query's position.
///
/// `content_hash` must be [`content_hash`] of `query.text`; callers that
/// already computed it pass it in rather than hashing the text twice.
#[must_use]
pub fn cache_key(method: &str, query: &DocumentQuery, content_hash: &str) -> String {
    let input = format!(
        "{method}\n{}\n{}:{}\n{content_hash}",
        query.path.display(),
        query.line,
        query.character
    );
    format!(
        "v{CACHE_VERSION}:{}",
        hex_encode(&Sha256::digest(input.as_bytes()))
    )
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    value: T,
}

/// Typed facade over a [`CacheBackend`].
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration, breaker: BreakerConfig) -> Self {
        Self {
            backend,
            ttl,
            breaker: Arc::new(CircuitBreaker::new("cache", breaker)),
        }
    }

    /// In-process cache per `config`, or `None` when caching is disabled.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let backend = Arc::new(MemoryCacheBackend::new(config.max_entries));
        Some(Self::new(backend, config.ttl(), config.breaker))
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Cached value for `key`. Every failure mode reads as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.breaker.call(|| self.backend.get(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(CallError::Open { .. }) => {
                tracing::debug!(key, "cache breaker open, treating as miss");
                return None;
            }
            Err(CallError::Inner(e)) => {
                tracing::warn!(key, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str::<Envelope<T>>(&raw) {
            Ok(entry) if entry.version == CACHE_VERSION => Some(entry.value),
            Ok(entry) => {
                tracing::debug!(key, version = entry.version, "stale cache entry version");
                None
            }
            Err(e) => {
                tracing::debug!(key, error = %e, "undecodable cache entry");
                None
            }
        }
    }

    /// Store `value` under `key`. Failures are logged and swallowed.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_string(&Envelope {
            version: CACHE_VERSION,
            value,
        }) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to serialize cache entry");
                return;
            }
        };

        match self.breaker.call(|| self.backend.set(key, raw, self.ttl)).await {
            Ok(()) => {}
            Err(CallError::Open { .. }) => {
                tracing::debug!(key, "cache breaker open, skipping write");
            }
            Err(CallError::Inner(e)) => {
                tracing::warn!(key, error = %e, "cache write failed");
            }
        }
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// Bounded in-process backend with per-entry TTL.
///
/// When full, expired entries are purged first, then the entry closest to
/// expiry is evicted.
pub struct MemoryCacheBackend {
    max_entries: usize,
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryCacheBackend {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, key: &str) -> Option<String> {
        let mut entries = self.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: &str, value: String, ttl: Duration) {
        let mut entries = self.lock();
        let now = Instant::now();
        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.max_entries
                && let Some(victim) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone())
            {
                entries.remove(&victim);
            }
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>> {
        Box::pin(async move { Ok(self.lookup(key)) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.store(key, value, ttl);
            Ok(())
        })
    }
}
