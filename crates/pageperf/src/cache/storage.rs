//! In-process cache storage.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CacheStorage, CachedResponse};
use crate::types::{PerfError, PerfResult};

/// `CacheStorage` backed by a map. Clones share the same caches.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStorage {
    // Vec keeps cache names in creation order, like `caches.keys()`.
    caches: Arc<RwLock<Vec<(String, BTreeMap<String, CachedResponse>)>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn keys(&self) -> Vec<String> {
        self.caches
            .read()
            .await
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    async fn open(&self, cache: &str) -> PerfResult<()> {
        let mut caches = self.caches.write().await;
        if !caches.iter().any(|(name, _)| name == cache) {
            caches.push((cache.to_string(), BTreeMap::new()));
        }
        Ok(())
    }

    async fn put(&self, cache: &str, key: &str, response: CachedResponse) -> PerfResult<()> {
        let mut caches = self.caches.write().await;
        let (_, entries) = caches
            .iter_mut()
            .find(|(name, _)| name == cache)
            .ok_or_else(|| PerfError::Cache(format!("cache '{cache}' is not open")))?;
        entries.insert(key.to_string(), response);
        Ok(())
    }

    async fn lookup(&self, cache: &str, key: &str) -> Option<CachedResponse> {
        self.caches
            .read()
            .await
            .iter()
            .find(|(name, _)| name == cache)
            .and_then(|(_, entries)| entries.get(key).cloned())
    }

    async fn delete(&self, cache: &str) -> bool {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|(name, _)| name != cache);
        caches.len() != before
    }

    async fn entries(&self, cache: &str) -> Vec<String> {
        self.caches
            .read()
            .await
            .iter()
            .find(|(name, _)| name == cache)
            .map(|(_, entries)| entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}
