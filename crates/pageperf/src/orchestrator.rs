//! Optimization orchestrator: runs the pass list against a document, once per pass.
//!
//! For every pass, in registration order:
//!
//! 1. skip if its idempotency marker is already on the document root,
//! 2. skip if the current [`DeviceContext`] does not satisfy its gate,
//! 3. otherwise plan and apply its effects inside a failure boundary
//!    (errors and panics are logged, never propagated) and set the marker.
//!
//! Heavy passes wait for idle time first, bounded by a timeout, so a single
//! task never holds the event loop for a whole pipeline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;

use crate::classifier::{ContextCell, EnvironmentSignals};
use crate::document::{apply_effects, is_marked, mark, DocumentHandle};
use crate::passes::{OptimizationPass, PassRegistry, PassWeight};
use crate::types::{DeviceContext, PerfError};

/// Default upper bound on how long a heavy pass waits for idle time.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(2000);

/// How a wait for idle time ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    Idle,
    TimedOut,
}

/// Cooperative-yield primitive used before heavy passes.
#[async_trait]
pub trait IdleScheduler: Send + Sync {
    /// Resolve once the host is idle, or after `timeout` at the latest.
    async fn idle(&self, timeout: Duration) -> IdleOutcome;
}

/// Yields back to the executor once and treats that as idle.
#[derive(Debug, Clone, Copy, Default)]
pub struct YieldScheduler;

#[async_trait]
impl IdleScheduler for YieldScheduler {
    async fn idle(&self, _timeout: Duration) -> IdleOutcome {
        tokio::task::yield_now().await;
        IdleOutcome::Idle
    }
}

/// Idle time reported by the host (the `requestIdleCallback` analogue).
///
/// The host calls [`IdleSignal::notify_idle`] whenever it has spare time;
/// waiters fall back to running anyway once their timeout elapses.
#[derive(Debug, Clone, Default)]
pub struct IdleSignal {
    notify: Arc<Notify>,
}

impl IdleSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_idle(&self) {
        self.notify.notify_one();
    }
}

#[async_trait]
impl IdleScheduler for IdleSignal {
    async fn idle(&self, timeout: Duration) -> IdleOutcome {
        match tokio::time::timeout(timeout, self.notify.notified()).await {
            Ok(()) => IdleOutcome::Idle,
            Err(_) => IdleOutcome::TimedOut,
        }
    }
}

/// A pass that failed inside the failure boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassFailure {
    pub id: String,
    pub error: String,
}

/// What one orchestrator run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub applied: Vec<String>,
    pub already_applied: Vec<String>,
    pub not_applicable: Vec<String>,
    pub failed: Vec<PassFailure>,
    /// Effects that actually changed the document.
    pub mutations: usize,
}

impl RunReport {
    /// Nothing was applied, attempted or changed.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.failed.is_empty() && self.mutations == 0
    }
}

/// Run `passes` in order against `doc` under `ctx`.
pub async fn run_passes(
    passes: &[OptimizationPass],
    ctx: &DeviceContext,
    doc: &mut dyn DocumentHandle,
    scheduler: &dyn IdleScheduler,
    idle_timeout: Duration,
) -> RunReport {
    let mut report = RunReport::default();

    for pass in passes {
        let id = pass.id();

        if is_marked(doc, id) {
            tracing::debug!(pass = id, "already applied");
            report.already_applied.push(id.to_string());
            continue;
        }

        if !pass.applies_when(ctx) {
            tracing::debug!(pass = id, "not applicable");
            report.not_applicable.push(id.to_string());
            continue;
        }

        if pass.weight() == PassWeight::Heavy {
            let outcome = scheduler.idle(idle_timeout).await;
            if outcome == IdleOutcome::TimedOut {
                tracing::debug!(pass = id, "idle wait timed out, running anyway");
            }
        }

        match run_isolated(pass, doc) {
            Ok(changed) => {
                tracing::info!(pass = id, changed, "pass applied");
                report.applied.push(id.to_string());
                report.mutations += changed;
            }
            Err(e) => {
                tracing::warn!(pass = id, error = %e, "pass failed");
                report.failed.push(PassFailure {
                    id: id.to_string(),
                    error: e.to_string(),
                });
            }
        }

        // A failed pass is marked too; it is not retried in this document lifetime.
        if let Err(e) = mark(doc, id) {
            tracing::warn!(pass = id, error = %e, "could not set idempotency marker");
        }
    }

    report
}

/// Plan and apply one pass, converting errors and panics into `PerfError::Pass`.
fn run_isolated(pass: &OptimizationPass, doc: &mut dyn DocumentHandle) -> Result<usize, PerfError> {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let effects = pass.plan(&*doc)?;
        apply_effects(doc, &effects)
    }));

    match outcome {
        Ok(Ok(changed)) => Ok(changed),
        Ok(Err(PerfError::Pass { id, message })) => Err(PerfError::Pass { id, message }),
        Ok(Err(e)) => Err(PerfError::Pass {
            id: pass.id().to_string(),
            message: e.to_string(),
        }),
        Err(panic) => Err(PerfError::Pass {
            id: pass.id().to_string(),
            message: panic_message(panic.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// Owns the pass registry, the current device context and the idle scheduler.
pub struct Orchestrator<S: IdleScheduler = YieldScheduler> {
    registry: PassRegistry,
    context: ContextCell,
    scheduler: S,
    idle_timeout: Duration,
}

impl Orchestrator<YieldScheduler> {
    pub fn new(registry: PassRegistry, signals: &EnvironmentSignals) -> Self {
        Self::with_scheduler(registry, signals, YieldScheduler)
    }
}

impl<S: IdleScheduler> Orchestrator<S> {
    pub fn with_scheduler(registry: PassRegistry, signals: &EnvironmentSignals, scheduler: S) -> Self {
        Self {
            registry,
            context: ContextCell::new(signals),
            scheduler,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn registry(&self) -> &PassRegistry {
        &self.registry
    }

    /// The current device context snapshot.
    pub fn context(&self) -> Arc<DeviceContext> {
        self.context.current()
    }

    /// Run every pass against `doc` under the current context.
    pub async fn run(&self, doc: &mut dyn DocumentHandle) -> RunReport {
        let ctx = self.context.current();
        run_passes(
            self.registry.passes(),
            &ctx,
            doc,
            &self.scheduler,
            self.idle_timeout,
        )
        .await
    }

    /// Reclassify after an environment change and run again.
    ///
    /// Already-marked passes stay untouched; passes that only now satisfy
    /// their gate get applied.
    pub async fn refresh(
        &mut self,
        signals: &EnvironmentSignals,
        doc: &mut dyn DocumentHandle,
    ) -> RunReport {
        if !self.context.refresh(signals) {
            tracing::debug!("environment change left the device context unchanged");
        }
        self.run(doc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, DomEffect};
    use crate::passes::{canonical_passes, PassSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mobile() -> EnvironmentSignals {
        let mut signals = EnvironmentSignals::viewport(375.0, 667.0);
        signals.touch_points_available = 5;
        signals.connection_effective_type = Some("4g".to_string());
        signals
    }

    fn page() -> Document {
        Document::new()
            .with_stylesheet("/css/site.css")
            .with_image("/img/hero.webp")
            .with_image("/img/counsellor.webp")
            .with_image("/img/office.webp")
    }

    #[tokio::test]
    async fn test_run_twice_is_noop() {
        let registry = canonical_passes(&PassSettings::default()).unwrap();
        let orchestrator = Orchestrator::new(registry, &mobile());
        let mut doc = page();

        let first = orchestrator.run(&mut doc).await;
        assert!(!first.applied.is_empty());
        assert!(first.failed.is_empty(), "failures: {:?}", first.failed);
        let after_first = doc.clone();

        let second = orchestrator.run(&mut doc).await;
        assert!(second.is_noop());
        assert_eq!(doc, after_first);
        assert_eq!(second.already_applied, first.applied);
    }

    #[tokio::test]
    async fn test_inapplicable_pass_is_not_marked() {
        let registry = canonical_passes(&PassSettings::default()).unwrap();
        let orchestrator = Orchestrator::new(registry, &EnvironmentSignals::viewport(1440.0, 900.0));
        let mut doc = page();

        let report = orchestrator.run(&mut doc).await;
        assert!(report.not_applicable.contains(&"touch-targets".to_string()));
        assert!(!doc.markers().contains(&"touch-targets"));
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let mut registry = PassRegistry::new();
        registry
            .register(OptimizationPass::new("broken", |_| true, |_| {
                Err(PerfError::Document("selector exploded".to_string()))
            }))
            .unwrap();
        registry
            .register(OptimizationPass::new("panicky", |_| true, |_| panic!("boom")))
            .unwrap();
        registry
            .register(OptimizationPass::new("fine", |_| true, |_| {
                Ok(vec![DomEffect::root_attr("data-fine", "yes")])
            }))
            .unwrap();

        let orchestrator = Orchestrator::new(registry, &mobile());
        let mut doc = Document::new();
        let report = orchestrator.run(&mut doc).await;

        assert_eq!(report.applied, vec!["fine".to_string()]);
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed[1].error.contains("boom"));
        assert_eq!(doc.root_attributes.get("data-fine").map(String::as_str), Some("yes"));

        // Failed passes are marked and never retried.
        let again = orchestrator.run(&mut doc).await;
        assert!(again.failed.is_empty());
        assert_eq!(again.already_applied.len(), 3);
    }

    #[tokio::test]
    async fn test_apply_runs_at_most_once_per_document() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = PassRegistry::new();
        registry
            .register(OptimizationPass::new("counted", |_| true, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }))
            .unwrap();

        let orchestrator = Orchestrator::new(registry, &mobile());
        let mut doc = Document::new();
        for _ in 0..3 {
            orchestrator.run(&mut doc).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A fresh document gets the pass again.
        orchestrator.run(&mut Document::new()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_applies_newly_gated_passes() {
        let registry = canonical_passes(&PassSettings::default()).unwrap();
        let mut orchestrator = Orchestrator::new(registry, &EnvironmentSignals::viewport(1440.0, 900.0));
        let mut doc = page();

        orchestrator.run(&mut doc).await;
        assert!(!doc.markers().contains(&"content-visibility"));

        let report = orchestrator.refresh(&mobile(), &mut doc).await;
        assert!(report.applied.contains(&"content-visibility".to_string()));
        assert!(report.applied.contains(&"touch-targets".to_string()));
        assert!(report.already_applied.contains(&"critical-css".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_signal_times_out() {
        let signal = IdleSignal::new();
        let outcome = signal.idle(Duration::from_millis(50)).await;
        assert_eq!(outcome, IdleOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_idle_signal_notified() {
        let signal = IdleSignal::new();
        signal.notify_idle();
        let outcome = signal.idle(Duration::from_secs(5)).await;
        assert_eq!(outcome, IdleOutcome::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heavy_pass_runs_after_idle_timeout() {
        let mut registry = PassRegistry::new();
        registry
            .register(
                OptimizationPass::new("heavy", |_| true, |_| {
                    Ok(vec![DomEffect::style("big", "main{contain:content}")])
                })
                .heavy(),
            )
            .unwrap();

        let orchestrator = Orchestrator::with_scheduler(registry, &mobile(), IdleSignal::new())
            .with_idle_timeout(Duration::from_millis(100));
        let mut doc = Document::new();
        let report = orchestrator.run(&mut doc).await;
        assert_eq!(report.applied, vec!["heavy".to_string()]);
        assert_eq!(doc.head.len(), 1);
    }
}
