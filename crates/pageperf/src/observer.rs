//! Web Vitals observer: folds performance entries into a shared [`VitalsRecord`].
//!
//! Each observation channel (LCP, input, layout shift, paint, navigation) is
//! consumed by its own task. Entries within one channel arrive in
//! chronological order; there is no ordering across channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::types::VitalsRecord;

/// Performance entry types the observer subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryType {
    LargestContentfulPaint,
    FirstInput,
    Event,
    LayoutShift,
    Paint,
    Navigation,
}

impl EntryType {
    pub const ALL: [EntryType; 6] = [
        EntryType::LargestContentfulPaint,
        EntryType::FirstInput,
        EntryType::Event,
        EntryType::LayoutShift,
        EntryType::Paint,
        EntryType::Navigation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LargestContentfulPaint => "largest-contentful-paint",
            Self::FirstInput => "first-input",
            Self::Event => "event",
            Self::LayoutShift => "layout-shift",
            Self::Paint => "paint",
            Self::Navigation => "navigation",
        }
    }
}

/// A performance entry, reduced to the fields the vitals need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entryType", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PerformanceEntry {
    LargestContentfulPaint {
        start_time: f64,
    },
    FirstInput {
        start_time: f64,
        processing_start: f64,
    },
    /// Event timing entry; only entries with a non-zero interaction id count.
    Event {
        interaction_id: u64,
        duration: f64,
    },
    LayoutShift {
        value: f64,
        had_recent_input: bool,
    },
    Paint {
        name: String,
        start_time: f64,
    },
    Navigation {
        request_start: f64,
        response_start: f64,
    },
}

impl PerformanceEntry {
    pub fn entry_type(&self) -> EntryType {
        match self {
            Self::LargestContentfulPaint { .. } => EntryType::LargestContentfulPaint,
            Self::FirstInput { .. } => EntryType::FirstInput,
            Self::Event { .. } => EntryType::Event,
            Self::LayoutShift { .. } => EntryType::LayoutShift,
            Self::Paint { .. } => EntryType::Paint,
            Self::Navigation { .. } => EntryType::Navigation,
        }
    }
}

fn valid(value: f64) -> Option<f64> {
    (value.is_finite() && value >= 0.0).then_some(value)
}

impl VitalsRecord {
    /// Fold one entry into the record. Returns `true` if a field changed.
    ///
    /// - LCP keeps the last candidate.
    /// - INP keeps the first qualifying input or interaction.
    /// - CLS sums shifts without recent input.
    /// - FCP keeps the first `first-contentful-paint` paint.
    /// - TTFB is `responseStart - requestStart` of the navigation entry.
    pub fn absorb(&mut self, entry: &PerformanceEntry) -> bool {
        match entry {
            PerformanceEntry::LargestContentfulPaint { start_time } => {
                let Some(v) = valid(*start_time) else {
                    return false;
                };
                let changed = self.lcp_ms != Some(v);
                self.lcp_ms = Some(v);
                changed
            }
            PerformanceEntry::FirstInput {
                start_time,
                processing_start,
            } => {
                if self.inp_ms.is_some() {
                    return false;
                }
                let Some(delay) = valid(processing_start - start_time) else {
                    return false;
                };
                self.inp_ms = Some(delay);
                true
            }
            PerformanceEntry::Event {
                interaction_id,
                duration,
            } => {
                if self.inp_ms.is_some() || *interaction_id == 0 {
                    return false;
                }
                let Some(d) = valid(*duration) else {
                    return false;
                };
                self.inp_ms = Some(d);
                true
            }
            PerformanceEntry::LayoutShift {
                value,
                had_recent_input,
            } => {
                if *had_recent_input {
                    return false;
                }
                let Some(v) = valid(*value) else {
                    return false;
                };
                self.cls_score = Some(self.cls_score.unwrap_or(0.0) + v);
                true
            }
            PerformanceEntry::Paint { name, start_time } => {
                if name != "first-contentful-paint" || self.fcp_ms.is_some() {
                    return false;
                }
                let Some(v) = valid(*start_time) else {
                    return false;
                };
                self.fcp_ms = Some(v);
                true
            }
            PerformanceEntry::Navigation {
                request_start,
                response_start,
            } => {
                if self.ttfb_ms.is_some() {
                    return false;
                }
                let Some(v) = valid(response_start - request_start) else {
                    return false;
                };
                self.ttfb_ms = Some(v);
                true
            }
        }
    }
}

/// Source of performance entries (the `PerformanceObserver` analogue).
pub trait PerformanceTimeline: Send + Sync {
    /// Subscribe to one entry type. `None` means the host does not support it.
    fn subscribe(&self, entry_type: EntryType) -> Option<mpsc::UnboundedReceiver<PerformanceEntry>>;
}

/// A host without any performance observation support.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedTimeline;

impl PerformanceTimeline for UnsupportedTimeline {
    fn subscribe(&self, _entry_type: EntryType) -> Option<mpsc::UnboundedReceiver<PerformanceEntry>> {
        None
    }
}

/// In-process timeline that entries are pushed into, e.g. by a bridge to the page.
#[derive(Debug, Default)]
pub struct ChannelTimeline {
    supported: Option<Vec<EntryType>>,
    subscribers: Mutex<HashMap<EntryType, Vec<mpsc::UnboundedSender<PerformanceEntry>>>>,
}

impl ChannelTimeline {
    /// A timeline supporting every entry type.
    pub fn new() -> Self {
        Self::default()
    }

    /// A timeline supporting only the given entry types.
    pub fn supporting(types: &[EntryType]) -> Self {
        Self {
            supported: Some(types.to_vec()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver an entry to every live subscriber of its type.
    pub fn emit(&self, entry: PerformanceEntry) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(senders) = subscribers.get_mut(&entry.entry_type()) {
            senders.retain(|tx| tx.send(entry.clone()).is_ok());
        }
    }
}

impl PerformanceTimeline for ChannelTimeline {
    fn subscribe(&self, entry_type: EntryType) -> Option<mpsc::UnboundedReceiver<PerformanceEntry>> {
        if let Some(supported) = &self.supported {
            if !supported.contains(&entry_type) {
                return None;
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entry_type)
            .or_default()
            .push(tx);
        Some(rx)
    }
}

/// Live subscription to the vitals of one page load.
///
/// Dropping or unsubscribing stops further updates; values already recorded
/// stay readable.
#[derive(Debug)]
pub struct VitalsStream {
    record: watch::Receiver<VitalsRecord>,
    tasks: JoinSet<()>,
}

impl VitalsStream {
    /// Copy of the record as it stands now.
    pub fn snapshot(&self) -> VitalsRecord {
        self.record.borrow().clone()
    }

    /// A receiver that can await updates.
    pub fn subscribe(&self) -> watch::Receiver<VitalsRecord> {
        self.record.clone()
    }

    /// Whether any observation channel is still feeding the record.
    ///
    /// Reaps channel tasks that have already finished, e.g. because the
    /// timeline went away.
    pub fn is_active(&mut self) -> bool {
        while self.tasks.try_join_next().is_some() {}
        !self.tasks.is_empty()
    }

    /// Stop observing. Already recorded values are kept.
    pub async fn unsubscribe(&mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        tracing::debug!("vitals observation stopped");
    }
}

/// Start observing every supported channel of `timeline`.
///
/// Must be called inside a tokio runtime. If the timeline supports none of
/// the channels the stream is inert and every field stays `None`.
pub fn observe(timeline: &dyn PerformanceTimeline) -> VitalsStream {
    let (sender, record) = watch::channel(VitalsRecord::now());
    let sender = Arc::new(sender);
    let mut tasks = JoinSet::new();

    for entry_type in EntryType::ALL {
        let Some(mut rx) = timeline.subscribe(entry_type) else {
            tracing::debug!(entry_type = entry_type.as_str(), "observation unsupported");
            continue;
        };
        let tx = Arc::clone(&sender);
        tasks.spawn(async move {
            while let Some(entry) = rx.recv().await {
                tx.send_if_modified(|record| record.absorb(&entry));
            }
        });
    }

    if tasks.is_empty() {
        tracing::debug!("no performance observation available, vitals stream is a no-op");
    }

    VitalsStream { record, tasks }
}
