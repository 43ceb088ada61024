//! Counter Store
//!
//! The capability interface admission control needs from a shared counter
//! store, an in-memory implementation, and the connection handle that resolves
//! a store from configuration.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::config::AdmissionConfig;
use super::error::{StoreError, StoreResult};
use super::upstash::UpstashStore;

/// Shared, key-addressable, TTL-capable atomic counter store
///
/// Every operation is individually atomic. No multi-key transaction is assumed.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value, or `None` if the key does not exist
    async fn get(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Overwrite the value (clears any expiry)
    async fn set(&self, key: &str, value: i64) -> StoreResult<()>;

    /// Delete the key, returning how many keys were removed
    async fn del(&self, key: &str) -> StoreResult<u64>;

    /// Add `by` and return the new value
    async fn incr_by(&self, key: &str, by: i64) -> StoreResult<i64>;

    /// Subtract `by` and return the new value
    async fn decr_by(&self, key: &str, by: i64) -> StoreResult<i64>;

    /// Set the key to expire after `ttl_secs`; false if the key does not exist
    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool>;

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.incr_by(key, 1).await
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        self.decr_by(key, 1).await
    }

    /// Short backend name for logs and metrics
    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process counter store
///
/// Mirrors the counter semantics of the shared store (increments keep an
/// existing expiry, `set` clears it, expired keys read as absent). Useful for
/// tests and single-instance deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining lifetime of a key, `None` if it is missing or has no expiry
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Whether a live key exists
    pub async fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.get(key).is_some_and(|e| e.is_live(now))
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no live keys
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn update(&self, key: &str, op: impl FnOnce(i64) -> Option<i64>) -> StoreResult<i64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = Entry {
                value: 0,
                expires_at: None,
            };
        }
        entry.value = op(entry.value).ok_or_else(|| {
            StoreError::Server("ERR increment or decrement would overflow".to_string())
        })?;
        Ok(entry.value)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries.get(key).filter(|e| e.is_live(now)).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: i64) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.remove(key) {
            Some(entry) if entry.is_live(now) => Ok(1),
            _ => Ok(0),
        }
    }

    async fn incr_by(&self, key: &str, by: i64) -> StoreResult<i64> {
        self.update(key, |v| v.checked_add(by)).await
    }

    async fn decr_by(&self, key: &str, by: i64) -> StoreResult<i64> {
        self.update(key, |v| v.checked_sub(by)).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + Duration::from_secs(ttl_secs));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct CachedConnection {
    url: String,
    token: String,
    store: Arc<dyn CounterStore>,
}

/// Resolves the counter store for a configuration
///
/// A pinned handle always returns the store it was built with. A lazy handle
/// connects on first use and reuses the connection for as long as the
/// configured URL and token stay the same.
pub struct StoreHandle {
    pinned: Option<Arc<dyn CounterStore>>,
    cached: Mutex<Option<CachedConnection>>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("pinned", &self.pinned.as_ref().map(|s| s.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl StoreHandle {
    /// Connect lazily from configuration
    pub fn lazy() -> Self {
        Self {
            pinned: None,
            cached: Mutex::new(None),
        }
    }

    /// Always use the given store
    pub fn pinned(store: Arc<dyn CounterStore>) -> Self {
        Self {
            pinned: Some(store),
            cached: Mutex::new(None),
        }
    }

    /// Get the store for `config`, or `None` if no store can be used
    pub fn resolve(&self, config: &AdmissionConfig) -> Option<Arc<dyn CounterStore>> {
        if let Some(store) = &self.pinned {
            return Some(Arc::clone(store));
        }

        let url = config.redis_url.as_deref().filter(|u| !u.is_empty())?;
        let token = config.redis_token.as_deref().filter(|t| !t.is_empty())?;

        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = cached.as_ref() {
            if conn.url == url && conn.token == token {
                return Some(Arc::clone(&conn.store));
            }
        }

        match UpstashStore::new(url, token, config.store_timeout()) {
            Ok(store) => {
                tracing::debug!(url, "Connected admission counter store");
                let store: Arc<dyn CounterStore> = Arc::new(store);
                *cached = Some(CachedConnection {
                    url: url.to_string(),
                    token: token.to_string(),
                    store: Arc::clone(&store),
                });
                Some(store)
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "Failed to build counter store client");
                None
            }
        }
    }
}
