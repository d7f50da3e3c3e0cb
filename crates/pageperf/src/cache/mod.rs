//! Service worker cache manager.
//!
//! Runs in its own execution context and talks to the page only through the
//! install / activate / fetch protocol. The worker owns its
//! [`CacheManifest`](crate::types::CacheManifest); storage and network are
//! injected behind traits.

pub mod network;
pub mod storage;
pub mod worker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::PerfResult;

pub use network::HttpNetwork;
pub use storage::MemoryCacheStorage;
pub use worker::{FetchOutcome, FetchSource, ServiceWorker, WorkerState};

/// A response as stored in (or served from) a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn ok(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            body: body.into(),
        }
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: Vec::new(),
        }
    }

    /// 2xx.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// `Request.destination`, reduced to what the routing cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestDestination {
    Document,
    Image,
    Style,
    Script,
    Font,
    Other,
}

impl RequestDestination {
    /// Guess a destination from a URL path's extension.
    pub fn infer(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        if path.is_empty() || path.ends_with('/') || path.ends_with(".html") {
            return Self::Document;
        }
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "css" => Self::Style,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "avif" | "svg" | "ico" => Self::Image,
            "js" | "mjs" => Self::Script,
            "woff" | "woff2" | "ttf" | "otf" => Self::Font,
            _ => Self::Other,
        }
    }
}

/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub destination: RequestDestination,
}

impl FetchRequest {
    pub fn get(url: &str, destination: RequestDestination) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.to_string(),
            destination,
        }
    }
}

/// The `CacheStorage` API as seen by the worker.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Names of every cache, in creation order.
    async fn keys(&self) -> Vec<String>;
    /// Create the cache if it does not exist.
    async fn open(&self, cache: &str) -> PerfResult<()>;
    async fn put(&self, cache: &str, key: &str, response: CachedResponse) -> PerfResult<()>;
    async fn lookup(&self, cache: &str, key: &str) -> Option<CachedResponse>;
    /// Delete a whole cache. Returns `false` if it did not exist.
    async fn delete(&self, cache: &str) -> bool;
    /// Keys stored in one cache.
    async fn entries(&self, cache: &str) -> Vec<String>;
}

/// The network as seen by the worker.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> PerfResult<CachedResponse>;
}
