//! Core data types shared by the optimizer, the vitals pipeline and the cache worker.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse device bucket derived from the viewport width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTier {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
            Self::Desktop => "desktop",
        }
    }
}

impl fmt::Display for DeviceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network bucket, taken from the Network Information effective type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionTier {
    #[serde(rename = "offline")]
    Offline,
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[serde(rename = "unknown")]
    Unknown,
}

impl ConnectionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Slow2g => "slow-2g",
            Self::TwoG => "2g",
            Self::ThreeG => "3g",
            Self::FourG => "4g",
            Self::Unknown => "unknown",
        }
    }

    /// `slow-2g` and `2g`.
    pub fn is_slow(&self) -> bool {
        matches!(self, Self::Slow2g | Self::TwoG)
    }
}

impl fmt::Display for ConnectionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of the runtime environment.
///
/// A new snapshot is produced on every resize, orientation or connection
/// change; existing snapshots are never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceContext {
    pub device_tier: DeviceTier,
    pub connection_tier: ConnectionTier,
    pub touch_capable: bool,
    pub reduced_motion: bool,
    pub save_data: bool,
    pub pixel_ratio: f64,
    #[serde(rename = "approxMemoryGB")]
    pub approx_memory_gb: f64,
}

impl DeviceContext {
    pub fn is_mobile(&self) -> bool {
        self.device_tier == DeviceTier::Mobile
    }

    /// Memory at or below 2 GB.
    pub fn is_low_memory(&self) -> bool {
        self.approx_memory_gb <= 2.0
    }
}

/// Core Web Vitals collected during one page load.
///
/// Fields fill in as performance entries arrive. Once handed to scoring or
/// reporting a record is treated as frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalsRecord {
    #[serde(default)]
    pub lcp_ms: Option<f64>,
    #[serde(default)]
    pub inp_ms: Option<f64>,
    #[serde(default)]
    pub cls_score: Option<f64>,
    #[serde(default)]
    pub fcp_ms: Option<f64>,
    #[serde(default)]
    pub ttfb_ms: Option<f64>,
    #[serde(default)]
    pub captured_at_epoch_ms: i64,
}

impl VitalsRecord {
    /// An empty record stamped with the given capture time.
    pub fn empty(captured_at_epoch_ms: i64) -> Self {
        Self {
            lcp_ms: None,
            inp_ms: None,
            cls_score: None,
            fcp_ms: None,
            ttfb_ms: None,
            captured_at_epoch_ms,
        }
    }

    /// An empty record stamped with the current wall-clock time.
    pub fn now() -> Self {
        Self::empty(chrono::Utc::now().timestamp_millis())
    }

    /// Enough data to be worth reporting: LCP and FCP are both known.
    pub fn is_reportable(&self) -> bool {
        self.lcp_ms.is_some() && self.fcp_ms.is_some()
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Lcp => self.lcp_ms,
            Metric::Inp => self.inp_ms,
            Metric::Cls => self.cls_score,
            Metric::Fcp => self.fcp_ms,
            Metric::Ttfb => self.ttfb_ms,
        }
    }
}

/// The five metrics tracked by the vitals pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Metric {
    Lcp,
    Inp,
    Cls,
    Fcp,
    Ttfb,
}

impl Metric {
    pub const ALL: [Metric; 5] = [Metric::Lcp, Metric::Inp, Metric::Cls, Metric::Fcp, Metric::Ttfb];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lcp => "LCP",
            Self::Inp => "INP",
            Self::Cls => "CLS",
            Self::Fcp => "FCP",
            Self::Ttfb => "TTFB",
        }
    }

    /// Unit suffix used when rendering values; CLS is unitless.
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Cls => "",
            _ => "ms",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Points removed from the score for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deduction {
    pub metric: Metric,
    pub amount: u8,
    pub reason: String,
}

/// Score derived from a [`VitalsRecord`]. Never stored, always recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceScore {
    pub value: u8,
    pub deductions: Vec<Deduction>,
}

impl PerformanceScore {
    /// One human-readable line per deduction.
    pub fn issues(&self) -> Vec<String> {
        self.deductions.iter().map(|d| d.reason.clone()).collect()
    }
}

/// Versioned list of URLs precached by the service worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    pub namespace: String,
    pub version: u32,
    pub cache_name: String,
    pub urls: BTreeSet<String>,
}

impl CacheManifest {
    pub fn new<I, S>(namespace: &str, version: u32, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespace: namespace.to_string(),
            version,
            cache_name: format!("{namespace}-v{version}"),
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }

    /// The manifest for a new URL set. The version only moves when the set changes.
    pub fn bump<I, S>(&self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let next: BTreeSet<String> = urls.into_iter().map(Into::into).collect();
        if next == self.urls {
            return self.clone();
        }
        Self::new(&self.namespace, self.version + 1, next)
    }
}

/// Errors that can occur in the optimizer, vitals and cache components.
#[derive(thiserror::Error, Debug)]
pub enum PerfError {
    #[error("Pass '{id}' failed: {message}")]
    Pass { id: String, message: String },

    #[error("Pass '{id}' must run after '{dependency}'")]
    PassOrder { id: String, dependency: String },

    #[error("Duplicate pass id: {0}")]
    DuplicatePass(String),

    #[error("Document error: {0}")]
    Document(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Cache install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid worker state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type PerfResult<T> = Result<T, PerfError>;
