//! pageperf: adaptive page optimization, Core Web Vitals observation and
//! scoring, best-effort telemetry, and a versioned service worker cache.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod document;
pub mod observer;
pub mod orchestrator;
pub mod passes;
pub mod reporter;
pub mod scoring;
pub mod types;

pub use cache::{CacheStorage, MemoryCacheStorage, Network, ServiceWorker, WorkerState};
pub use classifier::{classify, ContextCell, EnvironmentSignals};
pub use config::OptimizerConfig;
pub use document::{apply_effects, DocumentHandle, DomEffect};
pub use observer::{observe, PerformanceEntry, PerformanceTimeline, VitalsStream};
pub use orchestrator::{Orchestrator, RunReport};
pub use passes::{canonical_passes, OptimizationPass, PassRegistry, PassSettings};
pub use reporter::{HttpTransport, Reporter, TelemetryTransport, VitalsPayload};
pub use scoring::{score, score_with, Thresholds};
pub use types::*;
