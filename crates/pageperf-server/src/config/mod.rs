//! Configuration loading and resolution.

use std::path::PathBuf;

use pageperf::OptimizerConfig;

use crate::types::ServerResult;

pub const DEFAULT_ADDR: &str = "127.0.0.1:3100";

/// Resolve the listen address.
pub fn resolve_listen_addr(explicit: Option<&str>) -> String {
    if let Some(addr) = explicit {
        return addr.to_string();
    }

    if let Ok(env_addr) = std::env::var("PAGEPERF_ADDR") {
        if !env_addr.trim().is_empty() {
            return env_addr;
        }
    }

    DEFAULT_ADDR.to_string()
}

/// Resolve the optimizer config file, if any.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }

    if let Ok(env_path) = std::env::var("PAGEPERF_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    let cwd_config = PathBuf::from("pageperf.json");
    cwd_config.exists().then_some(cwd_config)
}

/// Load the optimizer config: file (if resolved), then environment overrides.
pub fn load_optimizer_config(explicit: Option<&str>) -> ServerResult<OptimizerConfig> {
    let path = resolve_config_path(explicit);
    if let Some(path) = &path {
        tracing::debug!("Loading config from {}", path.display());
    }
    Ok(OptimizerConfig::load(path.as_deref())?)
}
