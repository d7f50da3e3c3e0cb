//! Optimizer configuration: JSON file, defaults, then environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::orchestrator::DEFAULT_IDLE_TIMEOUT;
use crate::passes::PassSettings;
use crate::reporter::VITALS_PATH;
use crate::scoring::Thresholds;
use crate::types::{CacheManifest, DeviceTier, PerfError, PerfResult};

pub const ENV_TELEMETRY_ENDPOINT: &str = "PAGEPERF_TELEMETRY_ENDPOINT";
pub const ENV_CACHE_NAMESPACE: &str = "PAGEPERF_CACHE_NAMESPACE";
pub const ENV_CACHE_VERSION: &str = "PAGEPERF_CACHE_VERSION";
pub const ENV_IDLE_TIMEOUT_MS: &str = "PAGEPERF_IDLE_TIMEOUT_MS";

/// Service worker cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub namespace: String,
    pub version: u32,
    pub precache: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "pageperf".to_string(),
            version: 1,
            precache: vec!["/".to_string()],
        }
    }
}

impl CacheConfig {
    pub fn manifest(&self) -> CacheManifest {
        CacheManifest::new(&self.namespace, self.version, self.precache.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizerConfig {
    /// Absolute URL, or a path resolved against the page origin.
    pub telemetry_endpoint: String,
    pub report_timeout_ms: u64,
    /// How long a heavy pass waits for an idle period before running anyway.
    pub idle_timeout_ms: u64,
    pub cache: CacheConfig,
    pub passes: PassSettings,
    /// Replaces the default table for desktop pages only.
    pub desktop_thresholds: Option<Thresholds>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            telemetry_endpoint: VITALS_PATH.to_string(),
            report_timeout_ms: 5_000,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            cache: CacheConfig::default(),
            passes: PassSettings::default(),
            desktop_thresholds: None,
        }
    }
}

impl OptimizerConfig {
    /// Load from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> PerfResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot: a custom scoring table must stay monotonic.
    pub fn validate(&self) -> PerfResult<()> {
        if let Some(table) = &self.desktop_thresholds {
            table.validate()?;
        }
        Ok(())
    }

    /// Defaults, a file if one is given, then the environment.
    pub fn load(path: Option<&Path>) -> PerfResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> PerfResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(ENV_TELEMETRY_ENDPOINT) {
            self.telemetry_endpoint = endpoint;
        }
        if let Some(namespace) = lookup(ENV_CACHE_NAMESPACE) {
            self.cache.namespace = namespace;
        }
        if let Some(version) = lookup(ENV_CACHE_VERSION) {
            self.cache.version = parse_env(ENV_CACHE_VERSION, &version)?;
        }
        if let Some(timeout) = lookup(ENV_IDLE_TIMEOUT_MS) {
            self.idle_timeout_ms = parse_env(ENV_IDLE_TIMEOUT_MS, &timeout)?;
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_millis(self.report_timeout_ms)
    }

    /// The telemetry endpoint as an absolute URL for a page on `origin`.
    pub fn endpoint_for(&self, origin: &str) -> PerfResult<String> {
        let base = url::Url::parse(origin)
            .map_err(|e| PerfError::Config(format!("invalid origin '{origin}': {e}")))?;
        base.join(&self.telemetry_endpoint)
            .map(String::from)
            .map_err(|e| {
                PerfError::Config(format!(
                    "invalid telemetry endpoint '{}': {e}",
                    self.telemetry_endpoint
                ))
            })
    }

    /// Scoring table for a device tier, honouring the desktop override.
    pub fn thresholds_for(&self, tier: DeviceTier) -> Thresholds {
        match (tier, self.desktop_thresholds) {
            (DeviceTier::Desktop, Some(table)) => table,
            _ => Thresholds::for_device(tier),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> PerfResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| PerfError::Config(format!("{key}={value}: {e}")))
}
