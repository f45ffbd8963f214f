use tracing::info;

use super::{AnomalyKind, ArrivedRecord, ReconcileReport};

/// Latency percentiles over the on-time arrivals, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub samples: usize,
    pub min_us: f64,
    pub p50_us: f64,
    pub p90_us: f64,
    pub p99_us: f64,
    pub max_us: f64,
    pub mean_us: f64,
}

impl LatencySummary {
    /// Summarize the latencies of `records`. Returns `None` for an empty set.
    pub fn from_records(records: &[ArrivedRecord]) -> Option<Self> {
        if records.is_empty() {
            return None;
        }

        let mut latencies: Vec<u64> = records.iter().map(ArrivedRecord::latency_ns).collect();
        latencies.sort_unstable();

        let sum: u128 = latencies.iter().map(|&v| u128::from(v)).sum();
        let mean_ns = sum as f64 / latencies.len() as f64;

        Some(Self {
            samples: latencies.len(),
            min_us: ns_to_us(latencies[0]),
            p50_us: ns_to_us(nearest_rank(&latencies, 50.0)),
            p90_us: ns_to_us(nearest_rank(&latencies, 90.0)),
            p99_us: ns_to_us(nearest_rank(&latencies, 99.0)),
            max_us: ns_to_us(latencies[latencies.len() - 1]),
            mean_us: mean_ns / 1_000.0,
        })
    }
}

/// End-of-run totals reported alongside the datasets.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub sent: u64,
    pub arrived: usize,
    pub never_arrived: usize,
    pub arrived_too_late: usize,
    pub anomalies: u64,
    /// Fraction of sent messages that never arrived at all.
    pub loss_ratio: f64,
    pub latency: Option<LatencySummary>,
}

impl RunSummary {
    pub fn new(sent: u64, report: &ReconcileReport) -> Self {
        let loss_ratio = if sent == 0 {
            0.0
        } else {
            report.never_arrived.len() as f64 / sent as f64
        };

        Self {
            sent,
            arrived: report.arrived.len(),
            never_arrived: report.never_arrived.len(),
            arrived_too_late: report.arrived_too_late.len(),
            anomalies: report.anomalies.total(),
            loss_ratio,
            latency: LatencySummary::from_records(&report.arrived),
        }
    }

    /// Emit the summary and per-kind anomaly counts at info level.
    pub fn log(&self, report: &ReconcileReport) {
        info!(
            sent = self.sent,
            arrived = self.arrived,
            never_arrived = self.never_arrived,
            arrived_too_late = self.arrived_too_late,
            anomalies = self.anomalies,
            loss_ratio = %format!("{:.4}", self.loss_ratio),
            "run summary",
        );

        if let Some(lat) = &self.latency {
            info!(
                samples = lat.samples,
                min_us = %format!("{:.1}", lat.min_us),
                p50_us = %format!("{:.1}", lat.p50_us),
                p90_us = %format!("{:.1}", lat.p90_us),
                p99_us = %format!("{:.1}", lat.p99_us),
                max_us = %format!("{:.1}", lat.max_us),
                mean_us = %format!("{:.1}", lat.mean_us),
                "latency",
            );
        }

        for kind in AnomalyKind::all() {
            let count = report.anomalies.get(*kind);
            if count > 0 {
                info!(kind = %kind, count, "  anomalies by kind");
            }
        }
    }
}

/// Nearest-rank percentile over sorted, non-empty values.
fn nearest_rank(sorted: &[u64], percentile: f64) -> u64 {
    let rank = (percentile * sorted.len() as f64 / 100.0).ceil() as usize;
    let idx = rank.clamp(1, sorted.len()) - 1;
    sorted[idx]
}

fn ns_to_us(ns: u64) -> f64 {
    ns as f64 / 1_000.0
}
