//! Short-TTL memo of token resolutions, so hot subdomains skip the
//! directory (and its disk paths) entirely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::directory::TokenEntry;

struct CacheSlot {
    entry: TokenEntry,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct ResolverCache {
    inner: Arc<Mutex<HashMap<String, CacheSlot>>>,
    ttl: Duration,
}

impl ResolverCache {
    pub fn new(ttl: Duration) -> Self {
        ResolverCache {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheSlot>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key(token: &str) -> String {
        format!("token:{token}")
    }

    /// An expired slot is treated exactly like an absent one and dropped
    /// on first access.
    pub fn get(&self, token: &str) -> Option<TokenEntry> {
        let key = Self::key(token);
        let mut map = self.lock();
        match map.get(&key) {
            Some(slot) if slot.expires_at > Instant::now() => Some(slot.entry.clone()),
            Some(_) => {
                map.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Memoise a resolution for one TTL and schedule its eviction.
    pub fn insert(&self, token: &str, entry: TokenEntry) {
        let key = Self::key(token);
        let expires_at = Instant::now() + self.ttl;
        self.lock().insert(
            key.clone(),
            CacheSlot {
                entry,
                expires_at,
            },
        );

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let cache = self.clone();
            let ttl = self.ttl;
            handle.spawn(async move {
                tokio::time::sleep(ttl).await;
                cache.evict_if_expired(&key);
            });
        }
    }

    fn evict_if_expired(&self, key: &str) {
        let mut map = self.lock();
        if let Some(slot) = map.get(key) {
            if slot.expires_at <= Instant::now() {
                map.remove(key);
                debug!(key = %key, "resolver cache entry evicted");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
