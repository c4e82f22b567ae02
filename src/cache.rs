use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// A stored step output with its expiry window.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Utc::now(),
            ttl,
        }
    }

    /// Expired strictly after `ttl` seconds from `created_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_milliseconds() > self.ttl.as_millis() as i64
    }
}

/// Backend error. Never reaches the caller: the [`ResultCache`] front
/// downgrades every backend failure to a miss.
#[derive(Debug)]
pub struct CacheUnavailable(pub String);

impl std::fmt::Display for CacheUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cache backend unavailable: {}", self.0)
    }
}

/// Storage contract behind the cache. An in-process map satisfies it; a
/// remote key/value store is a drop-in replacement.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, CacheUnavailable>;
    async fn write(&self, key: &str, entry: CacheEntry) -> Result<(), CacheUnavailable>;
    async fn remove(&self, key: &str) -> Result<(), CacheUnavailable>;
    async fn clear(&self) -> Result<(), CacheUnavailable>;
}

#[async_trait]
impl<T: CacheBackend + ?Sized> CacheBackend for std::sync::Arc<T> {
    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, CacheUnavailable> {
        (**self).read(key).await
    }
    async fn write(&self, key: &str, entry: CacheEntry) -> Result<(), CacheUnavailable> {
        (**self).write(key, entry).await
    }
    async fn remove(&self, key: &str) -> Result<(), CacheUnavailable> {
        (**self).remove(key).await
    }
    async fn clear(&self) -> Result<(), CacheUnavailable> {
        (**self).clear().await
    }
}

/// In-memory TTL cache shared across concurrent requests.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|e| e.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, CacheUnavailable> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| CacheUnavailable(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    async fn write(&self, key: &str, entry: CacheEntry) -> Result<(), CacheUnavailable> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CacheUnavailable(e.to_string()))?;
        // Last write wins; overwriting an existing key is allowed.
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheUnavailable> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CacheUnavailable(e.to_string()))?;
        entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheUnavailable> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CacheUnavailable(e.to_string()))?;
        entries.clear();
        Ok(())
    }
}

/// Step-result cache front: deterministic fingerprint keys, lazy TTL
/// expiry, and failure-to-miss downgrade.
pub struct ResultCache {
    backend: Box<dyn CacheBackend>,
}

impl ResultCache {
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryCache::new()),
        }
    }

    pub fn with_backend(backend: Box<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Cache key for `(namespace, content)`.
    ///
    /// `namespace:` prefix keeps keys readable and guarantees identical
    /// content fed to different steps never collides; the hash tail is the
    /// first 16 hex chars of sha256 over `namespace + ":" + content`.
    pub fn fingerprint(namespace: &str, content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update(b":");
        hasher.update(content.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("{}:{}", namespace, &hex[..16])
    }

    /// Look up a previously computed value. Returns `None` on never-set,
    /// expired, and backend-failure alike.
    pub async fn get(&self, namespace: &str, content: &str) -> Option<String> {
        let key = Self::fingerprint(namespace, content);
        let entry = match self.backend.read(&key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(namespace, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };
        if entry.is_expired(Utc::now()) {
            debug!(namespace, key = %key, "cache entry expired");
            // Lazy deletion; a failure here just leaves the entry for the
            // next read to discard.
            if let Err(e) = self.backend.remove(&key).await {
                warn!(namespace, error = %e, "failed to evict expired cache entry");
            }
            return None;
        }
        Some(entry.value)
    }

    /// Store a computed value. Overwrites any existing entry for the key;
    /// a backend failure is logged and swallowed (the next get misses).
    pub async fn set(&self, namespace: &str, content: &str, value: String, ttl: Duration) {
        let key = Self::fingerprint(namespace, content);
        if let Err(e) = self.backend.write(&key, CacheEntry::new(value, ttl)).await {
            warn!(namespace, error = %e, "cache write failed, result will be recomputed");
        }
    }

    pub async fn clear(&self) {
        if let Err(e) = self.backend.clear().await {
            warn!(error = %e, "cache clear failed");
        }
    }
}
