//! Environment classifier: browser/device signals to a [`DeviceContext`] snapshot.
//!
//! Classification is a pure, total function: it never touches the document
//! and never fails. Missing or nonsensical signals fall back to the most
//! conservative value.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{ConnectionTier, DeviceContext, DeviceTier};

/// Viewports narrower than this are mobile.
pub const MOBILE_MAX_WIDTH: f64 = 768.0;

/// Viewports narrower than this (and at least [`MOBILE_MAX_WIDTH`]) are tablets.
pub const TABLET_MAX_WIDTH: f64 = 1024.0;

/// Assumed memory when `navigator.deviceMemory` is unavailable.
pub const DEFAULT_MEMORY_GB: f64 = 4.0;

/// Explicit snapshot of everything the classifier looks at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSignals {
    pub viewport_width: f64,
    pub viewport_height: f64,
    #[serde(default)]
    pub user_agent_string: String,
    #[serde(default)]
    pub touch_points_available: u32,
    #[serde(default)]
    pub connection_effective_type: Option<String>,
    #[serde(default)]
    pub connection_save_data: Option<bool>,
    #[serde(default, rename = "deviceMemoryGB")]
    pub device_memory_gb: Option<f64>,
    #[serde(default)]
    pub prefers_reduced_motion: Option<bool>,
    #[serde(default)]
    pub device_pixel_ratio: Option<f64>,
    /// `navigator.onLine`; `Some(false)` forces the offline tier.
    #[serde(default)]
    pub online: Option<bool>,
}

impl EnvironmentSignals {
    /// Signals for a plain viewport with every optional API missing.
    pub fn viewport(width: f64, height: f64) -> Self {
        Self {
            viewport_width: width,
            viewport_height: height,
            user_agent_string: String::new(),
            touch_points_available: 0,
            connection_effective_type: None,
            connection_save_data: None,
            device_memory_gb: None,
            prefers_reduced_motion: None,
            device_pixel_ratio: None,
            online: None,
        }
    }
}

/// Classify a signal snapshot.
pub fn classify(signals: &EnvironmentSignals) -> DeviceContext {
    DeviceContext {
        device_tier: device_tier(signals.viewport_width),
        connection_tier: connection_tier(signals),
        touch_capable: signals.touch_points_available > 0
            || user_agent_is_touch(&signals.user_agent_string),
        reduced_motion: signals.prefers_reduced_motion.unwrap_or(false),
        save_data: signals.connection_save_data.unwrap_or(false),
        pixel_ratio: positive_or(signals.device_pixel_ratio, 1.0),
        approx_memory_gb: positive_or(signals.device_memory_gb, DEFAULT_MEMORY_GB),
    }
}

fn device_tier(viewport_width: f64) -> DeviceTier {
    // NaN and non-positive widths land on mobile, the most conservative tier.
    if viewport_width.is_nan() || viewport_width < MOBILE_MAX_WIDTH {
        DeviceTier::Mobile
    } else if viewport_width < TABLET_MAX_WIDTH {
        DeviceTier::Tablet
    } else {
        DeviceTier::Desktop
    }
}

fn connection_tier(signals: &EnvironmentSignals) -> ConnectionTier {
    if signals.online == Some(false) {
        return ConnectionTier::Offline;
    }
    match signals
        .connection_effective_type
        .as_deref()
        .map(|s| s.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("offline") => ConnectionTier::Offline,
        Some("slow-2g") => ConnectionTier::Slow2g,
        Some("2g") => ConnectionTier::TwoG,
        Some("3g") => ConnectionTier::ThreeG,
        Some("4g") => ConnectionTier::FourG,
        _ => ConnectionTier::Unknown,
    }
}

fn user_agent_is_touch(ua: &str) -> bool {
    ["Mobi", "Android", "iPhone", "iPad"]
        .iter()
        .any(|needle| ua.contains(needle))
}

fn positive_or(value: Option<f64>, fallback: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => v,
        _ => fallback,
    }
}

/// Holder of the single current [`DeviceContext`].
///
/// Readers get a shared handle to the snapshot that was current when they
/// asked; a refresh swaps in a brand-new snapshot rather than editing the old one.
#[derive(Debug, Clone)]
pub struct ContextCell {
    current: Arc<DeviceContext>,
}

impl ContextCell {
    pub fn new(signals: &EnvironmentSignals) -> Self {
        Self {
            current: Arc::new(classify(signals)),
        }
    }

    pub fn current(&self) -> Arc<DeviceContext> {
        Arc::clone(&self.current)
    }

    /// Reclassify after a resize, orientation or connection change.
    ///
    /// Returns `true` when the new snapshot differs from the previous one.
    pub fn refresh(&mut self, signals: &EnvironmentSignals) -> bool {
        let next = classify(signals);
        let changed = *self.current != next;
        if changed {
            tracing::debug!(
                device = %next.device_tier,
                connection = %next.connection_tier,
                "device context changed"
            );
        }
        self.current = Arc::new(next);
        changed
    }
}
