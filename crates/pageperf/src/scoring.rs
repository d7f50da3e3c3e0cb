//! Scoring engine: deterministic `VitalsRecord -> PerformanceScore`.
//!
//! Starts at 100 and subtracts one fixed deduction per metric: the "poor"
//! amount if the poor threshold is exceeded, else the "needs improvement"
//! amount if that threshold is exceeded. Missing metrics cost nothing.

use serde::{Deserialize, Serialize};

use crate::types::{
    Deduction, DeviceTier, Metric, PerfError, PerfResult, PerformanceScore, VitalsRecord,
};

/// Thresholds and deductions for one metric. Thresholds are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricThreshold {
    pub needs_improvement: f64,
    pub poor: f64,
    pub needs_improvement_deduction: u8,
    pub poor_deduction: u8,
}

impl MetricThreshold {
    const fn new(needs_improvement: f64, poor: f64, ni_deduction: u8, poor_deduction: u8) -> Self {
        Self {
            needs_improvement,
            poor,
            needs_improvement_deduction: ni_deduction,
            poor_deduction,
        }
    }
}

/// The full threshold table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub lcp: MetricThreshold,
    pub inp: MetricThreshold,
    pub cls: MetricThreshold,
    pub fcp: MetricThreshold,
    pub ttfb: MetricThreshold,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            lcp: MetricThreshold::new(2500.0, 4000.0, 15, 30),
            inp: MetricThreshold::new(100.0, 300.0, 10, 25),
            cls: MetricThreshold::new(0.1, 0.25, 10, 25),
            fcp: MetricThreshold::new(1800.0, 3000.0, 8, 15),
            ttfb: MetricThreshold::new(600.0, 800.0, 8, 15),
        }
    }
}

impl Thresholds {
    /// The table used for a device tier. Every tier currently shares the default table.
    pub fn for_device(_tier: DeviceTier) -> Self {
        Self::default()
    }

    /// Reject tables under which worsening a metric could raise the score.
    pub fn validate(&self) -> PerfResult<()> {
        for metric in Metric::ALL {
            let t = self.get(metric);
            if !t.needs_improvement.is_finite() || !t.poor.is_finite() {
                return Err(PerfError::Config(format!("{metric} thresholds must be finite")));
            }
            if t.needs_improvement > t.poor {
                return Err(PerfError::Config(format!(
                    "{metric} needsImprovement ({}) exceeds poor ({})",
                    t.needs_improvement, t.poor
                )));
            }
            if t.needs_improvement_deduction > t.poor_deduction {
                return Err(PerfError::Config(format!(
                    "{metric} needsImprovementDeduction ({}) exceeds poorDeduction ({})",
                    t.needs_improvement_deduction, t.poor_deduction
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, metric: Metric) -> &MetricThreshold {
        match metric {
            Metric::Lcp => &self.lcp,
            Metric::Inp => &self.inp,
            Metric::Cls => &self.cls,
            Metric::Fcp => &self.fcp,
            Metric::Ttfb => &self.ttfb,
        }
    }
}

/// Score a record against the default table.
pub fn score(record: &VitalsRecord) -> PerformanceScore {
    score_with(record, &Thresholds::default())
}

/// Score a record against a specific table.
pub fn score_with(record: &VitalsRecord, thresholds: &Thresholds) -> PerformanceScore {
    let deductions: Vec<Deduction> = Metric::ALL
        .iter()
        .filter_map(|&metric| {
            let value = record.get(metric)?;
            deduction_for(metric, value, thresholds.get(metric))
        })
        .collect();

    let total: u32 = deductions.iter().map(|d| u32::from(d.amount)).sum();
    let value = 100u32.saturating_sub(total) as u8;

    PerformanceScore { value, deductions }
}

fn deduction_for(metric: Metric, value: f64, threshold: &MetricThreshold) -> Option<Deduction> {
    // NaN compares false against everything and falls through to no deduction.
    let (amount, label, limit) = if value > threshold.poor {
        (threshold.poor_deduction, "poor", threshold.poor)
    } else if value > threshold.needs_improvement {
        (
            threshold.needs_improvement_deduction,
            "needs improvement",
            threshold.needs_improvement,
        )
    } else {
        return None;
    };

    Some(Deduction {
        metric,
        amount,
        reason: format!(
            "{metric} is {label} ({}{unit} > {}{unit})",
            format_value(metric, value),
            format_value(metric, limit),
            unit = metric.unit()
        ),
    })
}

fn format_value(metric: Metric, value: f64) -> String {
    match metric {
        Metric::Cls => format!("{value:.3}"),
        _ => format!("{value:.0}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(lcp: Option<f64>, fcp: Option<f64>, cls: Option<f64>) -> VitalsRecord {
        VitalsRecord {
            lcp_ms: lcp,
            inp_ms: None,
            cls_score: cls,
            fcp_ms: fcp,
            ttfb_ms: None,
            captured_at_epoch_ms: 0,
        }
    }

    #[test]
    fn test_poor_lcp_costs_30() {
        let result = score(&record(Some(5000.0), Some(1200.0), Some(0.05)));
        assert_eq!(result.value, 70);
        assert_eq!(result.deductions.len(), 1);
        assert_eq!(result.deductions[0].metric, Metric::Lcp);
        assert_eq!(result.deductions[0].amount, 30);
    }

    #[test]
    fn test_good_record_is_100() {
        let result = score(&record(Some(2000.0), Some(1200.0), Some(0.05)));
        assert_eq!(result.value, 100);
        assert!(result.deductions.is_empty());
    }

    #[test]
    fn test_all_null_is_100() {
        let result = score(&VitalsRecord::empty(0));
        assert_eq!(result.value, 100);
    }

    #[test]
    fn test_only_one_tier_per_metric() {
        let result = score(&record(Some(4500.0), None, None));
        assert_eq!(result.deductions.len(), 1);
        assert_eq!(result.deductions[0].amount, 30);

        let result = score(&record(Some(3000.0), None, None));
        assert_eq!(result.deductions[0].amount, 15);
    }

    #[test]
    fn test_thresholds_are_exclusive() {
        let result = score(&record(Some(2500.0), Some(1800.0), Some(0.1)));
        assert_eq!(result.value, 100);
        let result = score(&record(Some(4000.0), None, Some(0.25)));
        assert_eq!(result.value, 100 - 15 - 10);
    }

    #[test]
    fn test_worst_case_is_zero_floor() {
        let worst = VitalsRecord {
            lcp_ms: Some(9000.0),
            inp_ms: Some(900.0),
            cls_score: Some(0.9),
            fcp_ms: Some(9000.0),
            ttfb_ms: Some(9000.0),
            captured_at_epoch_ms: 0,
        };
        let result = score(&worst);
        // 110 points of deductions, clamped at zero.
        assert_eq!(result.value, 0);
        assert_eq!(result.deductions.len(), 5);
    }

    #[test]
    fn test_saturates_with_custom_table() {
        let mut table = Thresholds::default();
        table.lcp.poor_deduction = 200;
        let result = score_with(&record(Some(9000.0), None, None), &table);
        assert_eq!(result.value, 0);
    }

    #[test]
    fn test_default_table_is_valid() {
        assert!(Thresholds::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_deductions_rejected() {
        let mut table = Thresholds::default();
        table.lcp.needs_improvement_deduction = 40;
        table.lcp.poor_deduction = 5;
        assert!(matches!(table.validate(), Err(PerfError::Config(_))));
    }

    #[test]
    fn test_inverted_or_non_finite_limits_rejected() {
        let mut table = Thresholds::default();
        table.cls.needs_improvement = 0.5;
        assert!(table.validate().is_err());

        let mut table = Thresholds::default();
        table.ttfb.poor = f64::INFINITY;
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_nan_metric_is_ignored() {
        let result = score(&record(Some(f64::NAN), None, None));
        assert_eq!(result.value, 100);
    }

    #[test]
    fn test_issue_text() {
        let result = score(&record(Some(5000.0), None, Some(0.3)));
        assert_eq!(
            result.issues(),
            vec![
                "LCP is poor (5000ms > 4000ms)".to_string(),
                "CLS is poor (0.300 > 0.250)".to_string(),
            ]
        );
    }

    #[test]
    fn test_monotonic_in_each_metric() {
        let steps = [0.0, 0.05, 0.1, 0.11, 0.2, 0.25, 0.26, 50.0, 100.0, 101.0, 300.0, 301.0,
            600.0, 601.0, 800.0, 801.0, 1800.0, 1801.0, 2500.0, 2501.0, 3000.0, 3001.0,
            4000.0, 4001.0, 10_000.0];
        let base = VitalsRecord {
            lcp_ms: Some(2000.0),
            inp_ms: Some(50.0),
            cls_score: Some(0.05),
            fcp_ms: Some(1000.0),
            ttfb_ms: Some(300.0),
            captured_at_epoch_ms: 0,
        };
        for metric in Metric::ALL {
            let mut previous = u8::MAX;
            for &value in &steps {
                let mut r = base.clone();
                match metric {
                    Metric::Lcp => r.lcp_ms = Some(value),
                    Metric::Inp => r.inp_ms = Some(value),
                    Metric::Cls => r.cls_score = Some(value),
                    Metric::Fcp => r.fcp_ms = Some(value),
                    Metric::Ttfb => r.ttfb_ms = Some(value),
                }
                let s = score(&r).value;
                assert!(s <= previous, "{metric} at {value} raised the score");
                previous = s;
            }
        }
    }
}
