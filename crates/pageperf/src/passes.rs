//! Optimization passes and the canonical, ordered pass registry.
//!
//! The registry is the single source of truth for what runs and in which
//! order. A pass may only declare a dependency on a pass registered before it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::document::{DocumentHandle, DomEffect, HeadNode, ListenerTarget, DEFERRED_MEDIA_ATTR};
use crate::types::{ConnectionTier, DeviceContext, DeviceTier, PerfError, PerfResult};

/// Style node id of the inlined critical CSS.
pub const CRITICAL_STYLE_ID: &str = "perf-critical-css";

/// Stylesheets carrying this attribute are never deferred.
pub const CRITICAL_LINK_ATTR: &str = "data-critical";

const FONT_DISPLAY_CSS: &str = "@font-face{font-display:swap}";

const RESERVE_IMAGE_SPACE_CSS: &str =
    "img{max-width:100%;height:auto}img:not([width]):not([height]){aspect-ratio:16/9}";

const REDUCED_MOTION_CSS: &str = "*,*::before,*::after{animation-duration:0.01ms!important;\
animation-iteration-count:1!important;transition-duration:0.01ms!important;\
scroll-behavior:auto!important}";

const TOUCH_TARGETS_CSS: &str = "a,button,input,select,textarea,label{touch-action:manipulation}\
nav a,nav button,.btn{min-height:44px;min-width:44px}";

const CONTENT_VISIBILITY_CSS: &str =
    "main>section:not(:first-of-type){content-visibility:auto;contain-intrinsic-size:auto 600px}";

const SAVE_DATA_CSS: &str = "[data-decorative]{background-image:none!important}";

/// How a pass is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassWeight {
    /// Runs synchronously within the current task.
    Light,
    /// Deferred to idle time (large CSS injection, image re-scan).
    Heavy,
}

impl fmt::Display for PassWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Light => f.pad("light"),
            Self::Heavy => f.pad("heavy"),
        }
    }
}

type AppliesFn = dyn Fn(&DeviceContext) -> bool + Send + Sync;
type PlanFn = dyn Fn(&dyn DocumentHandle) -> PerfResult<Vec<DomEffect>> + Send + Sync;

/// One optimization: a gate on the device context and a plan of DOM effects.
#[derive(Clone)]
pub struct OptimizationPass {
    id: String,
    weight: PassWeight,
    after: Vec<String>,
    applies_when: Arc<AppliesFn>,
    plan: Arc<PlanFn>,
}

impl OptimizationPass {
    pub fn new<A, P>(id: &str, applies_when: A, plan: P) -> Self
    where
        A: Fn(&DeviceContext) -> bool + Send + Sync + 'static,
        P: Fn(&dyn DocumentHandle) -> PerfResult<Vec<DomEffect>> + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            weight: PassWeight::Light,
            after: Vec::new(),
            applies_when: Arc::new(applies_when),
            plan: Arc::new(plan),
        }
    }

    /// Schedule this pass in idle time.
    pub fn heavy(mut self) -> Self {
        self.weight = PassWeight::Heavy;
        self
    }

    /// Declare that this pass relies on `dependency` having run first.
    pub fn after(mut self, dependency: &str) -> Self {
        self.after.push(dependency.to_string());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn weight(&self) -> PassWeight {
        self.weight
    }

    pub fn dependencies(&self) -> &[String] {
        &self.after
    }

    pub fn applies_when(&self, ctx: &DeviceContext) -> bool {
        (self.applies_when)(ctx)
    }

    /// Compute the effects this pass wants on `doc`. Does not mutate anything.
    pub fn plan(&self, doc: &dyn DocumentHandle) -> PerfResult<Vec<DomEffect>> {
        (self.plan)(doc)
    }
}

impl fmt::Debug for OptimizationPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizationPass")
            .field("id", &self.id)
            .field("weight", &self.weight)
            .field("after", &self.after)
            .finish_non_exhaustive()
    }
}

/// Ordered list of passes with unique ids.
#[derive(Debug, Clone, Default)]
pub struct PassRegistry {
    passes: Vec<OptimizationPass>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pass. Fails on a duplicate id or a dependency not yet registered.
    pub fn register(&mut self, pass: OptimizationPass) -> PerfResult<()> {
        if self.passes.iter().any(|p| p.id == pass.id) {
            return Err(PerfError::DuplicatePass(pass.id));
        }
        for dependency in &pass.after {
            if !self.passes.iter().any(|p| &p.id == dependency) {
                return Err(PerfError::PassOrder {
                    id: pass.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        self.passes.push(pass);
        Ok(())
    }

    pub fn passes(&self) -> &[OptimizationPass] {
        &self.passes
    }

    pub fn ids(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.id.as_str()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&OptimizationPass> {
        self.passes.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

/// Site-specific inputs for the canonical passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PassSettings {
    /// Above-the-fold CSS inlined into the head.
    pub critical_css: String,
    /// Third-party origins worth a preconnect.
    pub preconnect_origins: Vec<String>,
    /// Images in document order that are visible without scrolling.
    pub above_fold_images: usize,
}

impl Default for PassSettings {
    fn default() -> Self {
        Self {
            critical_css: "html{-webkit-text-size-adjust:100%}body{margin:0;\
font-family:system-ui,-apple-system,'Segoe UI',Roboto,sans-serif;line-height:1.5}\
header,.hero{min-height:60vh}"
                .to_string(),
            preconnect_origins: vec![
                "https://fonts.googleapis.com".to_string(),
                "https://fonts.gstatic.com".to_string(),
            ],
            above_fold_images: 2,
        }
    }
}

/// The canonical pass list, in execution order.
pub fn canonical_passes(settings: &PassSettings) -> PerfResult<PassRegistry> {
    let mut registry = PassRegistry::new();

    registry.register(OptimizationPass::new("passive-listeners", |_| true, |_| {
        let mut effects = Vec::new();
        for event_type in ["touchstart", "touchmove", "wheel", "scroll"] {
            effects.push(DomEffect::AddPassiveListener {
                target: ListenerTarget::Window,
                event_type: event_type.to_string(),
            });
        }
        effects.push(DomEffect::AddPassiveListener {
            target: ListenerTarget::Document,
            event_type: "touchstart".to_string(),
        });
        Ok(effects)
    }))?;

    let origins = settings.preconnect_origins.clone();
    registry.register(OptimizationPass::new(
        "resource-hints",
        |ctx| ctx.connection_tier != ConnectionTier::Offline,
        move |_| {
            let mut effects = Vec::new();
            for origin in &origins {
                let mut preconnect = DomEffect::link("preconnect", origin);
                if let DomEffect::AddLink { attrs, .. } = &mut preconnect {
                    attrs.insert("crossorigin".to_string(), String::new());
                }
                effects.push(preconnect);
                effects.push(DomEffect::link("dns-prefetch", origin));
            }
            Ok(effects)
        },
    ))?;

    let critical_css = settings.critical_css.clone();
    registry.register(
        OptimizationPass::new("critical-css", |_| true, move |_| {
            if critical_css.trim().is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![DomEffect::style(CRITICAL_STYLE_ID, &critical_css)])
        })
        .heavy(),
    )?;

    registry.register(
        OptimizationPass::new("defer-stylesheets", |_| true, plan_defer_stylesheets)
            .after("critical-css"),
    )?;

    registry.register(OptimizationPass::new("font-display", |_| true, |_| {
        Ok(vec![DomEffect::style("perf-font-display", FONT_DISPLAY_CSS)])
    }))?;

    let above_fold = settings.above_fold_images;
    registry.register(
        OptimizationPass::new("image-priority", |_| true, move |doc| {
            Ok(plan_image_priority(doc, above_fold))
        })
        .heavy(),
    )?;

    registry.register(OptimizationPass::new("reserve-image-space", |_| true, |_| {
        Ok(vec![DomEffect::style("perf-image-space", RESERVE_IMAGE_SPACE_CSS)])
    }))?;

    registry.register(OptimizationPass::new(
        "reduced-motion",
        |ctx| ctx.reduced_motion || (ctx.is_mobile() && ctx.connection_tier.is_slow()),
        |_| {
            Ok(vec![
                DomEffect::style("perf-reduced-motion", REDUCED_MOTION_CSS),
                DomEffect::root_attr("data-motion", "reduced"),
            ])
        },
    ))?;

    registry.register(OptimizationPass::new(
        "touch-targets",
        |ctx| ctx.touch_capable,
        |_| {
            Ok(vec![
                DomEffect::style("perf-touch-targets", TOUCH_TARGETS_CSS),
                DomEffect::root_attr("data-touch", "true"),
            ])
        },
    ))?;

    registry.register(
        OptimizationPass::new(
            "content-visibility",
            |ctx| ctx.device_tier != DeviceTier::Desktop || ctx.is_low_memory(),
            |_| Ok(vec![DomEffect::style("perf-content-visibility", CONTENT_VISIBILITY_CSS)]),
        )
        .heavy(),
    )?;

    registry.register(
        OptimizationPass::new(
            "save-data",
            |ctx| ctx.save_data || ctx.connection_tier.is_slow(),
            plan_save_data,
        )
        .after("image-priority"),
    )?;

    Ok(registry)
}

fn plan_defer_stylesheets(doc: &dyn DocumentHandle) -> PerfResult<Vec<DomEffect>> {
    let head = doc.head();
    let has_critical = head
        .iter()
        .any(|n| matches!(n, HeadNode::Style { id, .. } if id == CRITICAL_STYLE_ID));
    // Deferring without inlined critical CSS would flash unstyled content.
    if !has_critical {
        return Ok(Vec::new());
    }

    Ok(head
        .into_iter()
        .filter_map(|node| match node {
            HeadNode::Link { rel, href, attrs }
                if rel == "stylesheet"
                    && !attrs.contains_key(CRITICAL_LINK_ATTR)
                    && !attrs.contains_key(DEFERRED_MEDIA_ATTR) =>
            {
                Some(DomEffect::DeferStylesheet { href })
            }
            _ => None,
        })
        .collect())
}

fn plan_image_priority(doc: &dyn DocumentHandle, above_fold: usize) -> Vec<DomEffect> {
    let mut effects = Vec::new();
    for index in 0..doc.images().len() {
        if index == 0 {
            effects.push(DomEffect::image_attr(index, "fetchpriority", "high"));
            effects.push(DomEffect::image_attr(index, "loading", "eager"));
        } else if index >= above_fold {
            effects.push(DomEffect::image_attr(index, "loading", "lazy"));
        }
        effects.push(DomEffect::image_attr(index, "decoding", "async"));
    }
    effects
}

fn plan_save_data(doc: &dyn DocumentHandle) -> PerfResult<Vec<DomEffect>> {
    let mut effects = vec![
        DomEffect::root_attr("data-save-data", "true"),
        DomEffect::style("perf-save-data", SAVE_DATA_CSS),
    ];
    for index in 1..doc.images().len() {
        effects.push(DomEffect::image_attr(index, "loading", "lazy"));
    }
    Ok(effects)
}
