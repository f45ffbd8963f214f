use std::time::Duration;

use streamprobe::rate::RateController;
use streamprobe::reconcile::summary::RunSummary;
use streamprobe::reconcile::{AnomalyKind, Outcome, Reconciler};

/// Issue `count` ids with sent time `id * 1000`.
fn issued(count: u64) -> Reconciler {
    let mut r = Reconciler::new();
    for id in 0..count {
        r.expect(id, id * 1_000);
    }
    r
}

fn ids<T>(records: &[T], id: impl Fn(&T) -> u64) -> Vec<u64> {
    records.iter().map(id).collect()
}

#[test]
fn in_order_stream() {
    let mut r = issued(3);
    for id in 0..3 {
        r.on_arrival(id, id * 1_000 + 500);
    }
    r.sweep();

    let report = r.take_report();
    assert_eq!(ids(&report.arrived, |a| a.id), vec![0, 1, 2]);
    assert!(report.arrived.iter().all(|a| a.received_ns >= a.sent_ns));
    assert!(report.never_arrived.is_empty());
    assert!(report.arrived_too_late.is_empty());
}

#[test]
fn single_reorder() {
    let mut r = issued(3);
    r.on_arrival(1, 1_500);
    r.on_arrival(0, 1_600);
    r.on_arrival(2, 2_500);
    r.sweep();

    let report = r.take_report();
    assert_eq!(ids(&report.arrived, |a| a.id), vec![1, 2]);
    assert_eq!(report.arrived_too_late.len(), 1);
    assert_eq!(report.arrived_too_late[0].id, 0);
    assert_eq!(report.arrived_too_late[0].sent_ns, 0);
    assert_eq!(report.arrived_too_late[0].received_ns, 1_600);
    assert!(report.never_arrived.is_empty());
}

#[test]
fn total_loss() {
    let mut r = issued(100);
    assert_eq!(r.sweep(), 100);

    let report = r.take_report();
    assert!(report.arrived.is_empty());
    assert_eq!(report.never_arrived.len(), 100);
    assert_eq!(ids(&report.never_arrived, |n| n.id), (0..100).collect::<Vec<_>>());
}

#[test]
fn permanent_drop_with_later_arrivals() {
    let mut r = issued(10);
    for id in (0..10).filter(|id| *id != 4) {
        r.on_arrival(id, id * 1_000 + 10);
    }
    r.sweep();

    let report = r.take_report();
    assert_eq!(ids(&report.never_arrived, |n| n.id), vec![4]);
    assert_eq!(report.never_arrived[0].sent_ns, 4_000);
    assert_eq!(report.arrived.len(), 9);
    assert!(report.arrived_too_late.is_empty());
}

#[test]
fn duplicate_is_anomaly_not_overwrite() {
    let mut r = issued(2);
    r.on_arrival(0, 100);

    let dup = r.on_arrival(0, 200);
    assert_eq!(dup.outcome, Outcome::Anomaly(AnomalyKind::UnknownId));

    let report = r.take_report();
    assert_eq!(report.arrived.len(), 1);
    assert_eq!(report.arrived[0].received_ns, 100);
    assert_eq!(report.anomalies.unknown_id, 1);
}

#[test]
fn accounting_holds_under_shuffled_arrivals() {
    // Deterministic shuffle: swap neighbours, drop every 7th id.
    let count = 1_000u64;
    let mut r = issued(count);

    let mut order: Vec<u64> = (0..count).filter(|id| id % 7 != 3).collect();
    for pair in order.chunks_mut(2) {
        pair.reverse();
    }
    for (i, id) in order.iter().enumerate() {
        r.on_arrival(*id, 1_000_000 + i as u64);
    }
    r.sweep();

    let report = r.take_report();
    assert_eq!(report.accounted() as u64, count);
    assert_eq!(report.anomalies.total(), 0);
    assert!(report
        .never_arrived
        .iter()
        .all(|n| n.id % 7 == 3));
    assert!(report
        .never_arrived
        .windows(2)
        .all(|w| w[0].id < w[1].id));

    let summary = RunSummary::new(count, &report);
    assert_eq!(summary.never_arrived, report.never_arrived.len());
    let latency = summary.latency.expect("latency");
    assert!(latency.p50_us <= latency.p99_us);
}

#[test]
fn ramp_reaches_600_hz_after_five_seconds() {
    let rc = RateController::ramping(100.0, 100.0).expect("rate");
    assert_eq!(rc.rate_at(Duration::from_secs(5)), 600.0);
}
