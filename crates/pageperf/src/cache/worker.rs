//! The worker lifecycle: install, activate, fetch.

use std::fmt;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::{CacheStorage, CachedResponse, FetchRequest, Network, RequestDestination};
use crate::types::{CacheManifest, PerfError, PerfResult};

/// Lifecycle states. `Redundant` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// Where a fetch was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchSource {
    /// Served from the current cache.
    Cache,
    /// Cache miss; fetched and stored for next time.
    NetworkCached,
    /// Not intercepted, or not cacheable.
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub response: CachedResponse,
    pub source: FetchSource,
}

/// One versioned service worker bound to an origin.
pub struct ServiceWorker<S: CacheStorage, N: Network> {
    manifest: CacheManifest,
    origin: Url,
    state: WorkerState,
    clients_claimed: bool,
    storage: Arc<S>,
    network: Arc<N>,
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
    pub fn new(
        manifest: CacheManifest,
        origin: &str,
        storage: Arc<S>,
        network: Arc<N>,
    ) -> PerfResult<Self> {
        let origin = Url::parse(origin)
            .map_err(|e| PerfError::Config(format!("invalid origin '{origin}': {e}")))?;
        if origin.cannot_be_a_base() {
            return Err(PerfError::Config(format!("origin '{origin}' cannot be a base URL")));
        }
        Ok(Self {
            manifest,
            origin,
            state: WorkerState::Parsed,
            clients_claimed: false,
            storage,
            network,
        })
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn manifest(&self) -> &CacheManifest {
        &self.manifest
    }

    pub fn cache_name(&self) -> &str {
        &self.manifest.cache_name
    }

    /// True once activation has claimed open clients.
    pub fn controls_clients(&self) -> bool {
        self.clients_claimed
    }

    /// Precache every manifest URL. All or nothing: on any failure a cache
    /// created by this install is deleted and the worker becomes redundant.
    /// A cache that already existed under the same name is left in place.
    pub async fn install(&mut self) -> PerfResult<()> {
        self.expect_state(WorkerState::Parsed)?;
        self.state = WorkerState::Installing;
        info!(cache = %self.manifest.cache_name, urls = self.manifest.urls.len(), "Installing");

        let preexisting = self
            .storage
            .keys()
            .await
            .iter()
            .any(|name| name == &self.manifest.cache_name);

        match self.precache().await {
            Ok(count) => {
                self.state = WorkerState::Installed;
                info!(cache = %self.manifest.cache_name, entries = count, "Installed");
                Ok(())
            }
            Err(e) => {
                if !preexisting {
                    self.storage.delete(&self.manifest.cache_name).await;
                }
                self.state = WorkerState::Redundant;
                warn!(cache = %self.manifest.cache_name, "Install failed: {e}");
                Err(e)
            }
        }
    }

    async fn precache(&self) -> PerfResult<usize> {
        let targets = self
            .manifest
            .urls
            .iter()
            .map(|raw| {
                let url = self.resolve(raw).map_err(|e| PerfError::InstallFailed {
                    url: raw.clone(),
                    reason: e.to_string(),
                })?;
                Ok((raw.clone(), url))
            })
            .collect::<PerfResult<Vec<_>>>()?;

        let network = &self.network;
        let fetched = try_join_all(targets.into_iter().map(|(raw, url)| async move {
            let request = FetchRequest::get(url.as_str(), RequestDestination::infer(url.path()));
            let response = network
                .fetch(&request)
                .await
                .map_err(|e| PerfError::InstallFailed {
                    url: raw.clone(),
                    reason: e.to_string(),
                })?;
            if !response.is_ok() {
                return Err(PerfError::InstallFailed {
                    url: raw,
                    reason: format!("status {}", response.status),
                });
            }
            Ok((cache_key(&url), response))
        }))
        .await?;

        let cache = &self.manifest.cache_name;
        self.storage.open(cache).await?;
        let count = fetched.len();
        for (key, response) in fetched {
            self.storage.put(cache, &key, response).await?;
        }
        Ok(count)
    }

    /// Delete every cache except the current one and claim clients.
    /// Returns the names that were purged.
    pub async fn activate(&mut self) -> PerfResult<Vec<String>> {
        self.expect_state(WorkerState::Installed)?;
        self.state = WorkerState::Activating;

        let mut purged = Vec::new();
        for name in self.storage.keys().await {
            if name != self.manifest.cache_name && self.storage.delete(&name).await {
                debug!(cache = %name, "Purged stale cache");
                purged.push(name);
            }
        }

        self.clients_claimed = true;
        self.state = WorkerState::Activated;
        info!(cache = %self.manifest.cache_name, purged = purged.len(), "Activated");
        Ok(purged)
    }

    /// Whether a request is routed through the cache.
    ///
    /// Only same-origin GETs for images, stylesheets and the root document are.
    pub fn intercepts(&self, request: &FetchRequest) -> bool {
        if !request.method.eq_ignore_ascii_case("GET") {
            return false;
        }
        let Ok(url) = self.resolve(&request.url) else {
            return false;
        };
        if url.origin() != self.origin.origin() {
            return false;
        }
        match request.destination {
            RequestDestination::Image | RequestDestination::Style => true,
            RequestDestination::Document => url.path() == "/",
            _ => false,
        }
    }

    /// Answer a request. Cache-first for intercepted requests once activated,
    /// straight to the network otherwise.
    pub async fn fetch(&self, request: &FetchRequest) -> PerfResult<FetchOutcome> {
        if self.state != WorkerState::Activated || !self.intercepts(request) {
            let response = self.network.fetch(request).await?;
            return Ok(FetchOutcome {
                response,
                source: FetchSource::Network,
            });
        }

        let url = self.resolve(&request.url)?;
        let key = cache_key(&url);
        let cache = &self.manifest.cache_name;

        if let Some(response) = self.storage.lookup(cache, &key).await {
            debug!(%key, "Cache hit");
            return Ok(FetchOutcome {
                response,
                source: FetchSource::Cache,
            });
        }

        let response = self.network.fetch(request).await?;
        if !response.is_ok() {
            return Ok(FetchOutcome {
                response,
                source: FetchSource::Network,
            });
        }

        // A failed write still serves the response.
        match self.storage.put(cache, &key, response.clone()).await {
            Ok(()) => Ok(FetchOutcome {
                response,
                source: FetchSource::NetworkCached,
            }),
            Err(e) => {
                warn!(%key, "Cache write failed: {e}");
                Ok(FetchOutcome {
                    response,
                    source: FetchSource::Network,
                })
            }
        }
    }

    fn resolve(&self, raw: &str) -> PerfResult<Url> {
        self.origin
            .join(raw)
            .map_err(|e| PerfError::Cache(format!("invalid url '{raw}': {e}")))
    }

    fn expect_state(&self, expected: WorkerState) -> PerfResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PerfError::InvalidState {
                expected: expected.to_string(),
                actual: self.state.to_string(),
            })
        }
    }
}

/// Path and query; the worker only stores same-origin entries.
fn cache_key(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}
