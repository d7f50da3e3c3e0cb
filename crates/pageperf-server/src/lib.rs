//! pageperf server: the Web Vitals telemetry endpoint and operator tooling.

pub mod config;
pub mod routes;
pub mod types;

pub use config::{load_optimizer_config, resolve_listen_addr};
pub use routes::{router, serve, AppState};
pub use types::{ServerError, ServerResult};
