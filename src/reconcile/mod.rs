//! Online reconciliation of arrival notifications against the expectation
//! ledger.
//!
//! The ledger is a FIFO of `(id, sent_ns)` entries in send order. Because ids
//! are issued in strictly increasing order, an arrival can be resolved by
//! looking only at the front of the FIFO:
//!
//! - equal to the front: the message arrived in order;
//! - greater than the front: every front entry it skips over is declared
//!   never-arrived and moved to a side map, then matching continues;
//! - smaller than the front: the id must already be in the never-arrived map,
//!   and is promoted to arrived-too-late.
//!
//! Memory is bounded by the reorder window rather than the traffic volume.
//! [`Reconciler`] is not internally synchronized; the runner wraps it in a
//! single mutex shared by the emitter (ledger pushes) and the arrival consumer.

pub mod summary;

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tracing::debug;

/// An in-flight message awaiting resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: u64,
    pub sent_ns: u64,
}

/// A message whose arrival was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivedRecord {
    pub id: u64,
    pub sent_ns: u64,
    pub received_ns: u64,
}

impl ArrivedRecord {
    /// End-to-end latency, clamped at zero.
    pub fn latency_ns(&self) -> u64 {
        self.received_ns.saturating_sub(self.sent_ns)
    }
}

/// A message declared lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeverArrivedRecord {
    pub id: u64,
    pub sent_ns: u64,
}

/// Arrivals that could not be matched to any ledger or lost-id state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyKind {
    /// Ledger was empty and the id was not among the lost ids.
    EmptyLedger,
    /// Id below the ledger front that was not among the lost ids: a duplicate
    /// or an already resolved id.
    UnknownId,
    /// Id the emitter never issued.
    NeverIssued,
    /// Datagram could not be decoded into a message.
    Undecodable,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyLedger => "empty_ledger",
            Self::UnknownId => "unknown_id",
            Self::NeverIssued => "never_issued",
            Self::Undecodable => "undecodable",
        }
    }

    pub fn all() -> &'static [AnomalyKind] {
        &[
            Self::EmptyLedger,
            Self::UnknownId,
            Self::NeverIssued,
            Self::Undecodable,
        ]
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomaly counters by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnomalyCounts {
    pub empty_ledger: u64,
    pub unknown_id: u64,
    pub never_issued: u64,
    pub undecodable: u64,
}

impl AnomalyCounts {
    pub fn record(&mut self, kind: AnomalyKind) {
        let slot = match kind {
            AnomalyKind::EmptyLedger => &mut self.empty_ledger,
            AnomalyKind::UnknownId => &mut self.unknown_id,
            AnomalyKind::NeverIssued => &mut self.never_issued,
            AnomalyKind::Undecodable => &mut self.undecodable,
        };
        *slot += 1;
    }

    pub fn get(&self, kind: AnomalyKind) -> u64 {
        match kind {
            AnomalyKind::EmptyLedger => self.empty_ledger,
            AnomalyKind::UnknownId => self.unknown_id,
            AnomalyKind::NeverIssued => self.never_issued,
            AnomalyKind::Undecodable => self.undecodable,
        }
    }

    pub fn total(&self) -> u64 {
        self.empty_ledger + self.unknown_id + self.never_issued + self.undecodable
    }
}

/// Classification of a single arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Arrived(ArrivedRecord),
    ArrivedTooLate(ArrivedRecord),
    Anomaly(AnomalyKind),
}

/// Result of reconciling one arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: Outcome,
    /// Ledger entries drained into never-arrived while resolving.
    pub drained: usize,
}

/// Final classification collections handed to the dataset writer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Ordered by id.
    pub arrived: Vec<ArrivedRecord>,
    /// Ordered by id; excludes ids later promoted to arrived-too-late.
    pub never_arrived: Vec<NeverArrivedRecord>,
    /// Ordered by id.
    pub arrived_too_late: Vec<ArrivedRecord>,
    pub anomalies: AnomalyCounts,
    /// Ledger entries still unresolved when the report was taken.
    pub pending: usize,
}

impl ReconcileReport {
    /// Number of ids accounted for across all three classes and the ledger.
    pub fn accounted(&self) -> usize {
        self.arrived.len() + self.never_arrived.len() + self.arrived_too_late.len() + self.pending
    }
}

/// Merge-drain matcher over the expectation ledger.
#[derive(Debug, Default)]
pub struct Reconciler {
    ledger: VecDeque<LedgerEntry>,
    never_arrived: HashMap<u64, u64>,
    arrived: Vec<ArrivedRecord>,
    arrived_too_late: Vec<ArrivedRecord>,
    anomalies: AnomalyCounts,
    /// One past the highest id pushed onto the ledger.
    next_id: u64,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size the ledger and arrived set for `expected` messages.
    pub fn with_capacity(expected: usize) -> Self {
        Self {
            ledger: VecDeque::with_capacity(expected),
            arrived: Vec::with_capacity(expected),
            ..Self::default()
        }
    }

    /// Push a ledger entry for a message about to be sent.
    ///
    /// Ids must be strictly increasing across calls; an out-of-order id is
    /// dropped, since accepting it would break the FIFO ordering every
    /// resolution relies on.
    pub fn expect(&mut self, id: u64, sent_ns: u64) {
        if id < self.next_id {
            debug!(id, next_id = self.next_id, "ignoring out-of-order ledger entry");
            return;
        }

        self.ledger.push_back(LedgerEntry { id, sent_ns });
        self.next_id = id.saturating_add(1);
    }

    /// Resolve an arrival for `id` observed at `received_ns`.
    pub fn on_arrival(&mut self, id: u64, received_ns: u64) -> Resolution {
        if id >= self.next_id {
            return self.anomaly(AnomalyKind::NeverIssued, id, 0);
        }

        let mut drained = 0;

        while let Some(front) = self.ledger.front().copied() {
            if id == front.id {
                self.ledger.pop_front();
                let record = ArrivedRecord {
                    id,
                    sent_ns: front.sent_ns,
                    received_ns,
                };
                self.arrived.push(record);
                return Resolution {
                    outcome: Outcome::Arrived(record),
                    drained,
                };
            }

            if id < front.id {
                return self.promote_or_reject(id, received_ns, drained, AnomalyKind::UnknownId);
            }

            // id > front: the front was overtaken by a later message.
            self.ledger.pop_front();
            self.never_arrived.insert(front.id, front.sent_ns);
            drained += 1;
        }

        self.promote_or_reject(id, received_ns, drained, AnomalyKind::EmptyLedger)
    }

    /// Count an arrival that never reached id resolution.
    pub fn record_anomaly(&mut self, kind: AnomalyKind) {
        self.anomalies.record(kind);
    }

    /// Force every unresolved ledger entry into never-arrived.
    pub fn sweep(&mut self) -> usize {
        let swept = self.ledger.len();
        for entry in self.ledger.drain(..) {
            self.never_arrived.insert(entry.id, entry.sent_ns);
        }
        swept
    }

    /// Number of ids pushed onto the ledger so far.
    pub fn issued(&self) -> u64 {
        self.next_id
    }

    /// Ledger entries awaiting resolution.
    pub fn pending(&self) -> usize {
        self.ledger.len()
    }

    pub fn arrived_count(&self) -> usize {
        self.arrived.len()
    }

    pub fn never_arrived_count(&self) -> usize {
        self.never_arrived.len()
    }

    pub fn arrived_too_late_count(&self) -> usize {
        self.arrived_too_late.len()
    }

    pub fn anomalies(&self) -> AnomalyCounts {
        self.anomalies
    }

    /// Move the classification collections out, leaving the reconciler empty
    /// apart from its ledger.
    pub fn take_report(&mut self) -> ReconcileReport {
        let arrived = std::mem::take(&mut self.arrived);

        let mut never_arrived: Vec<NeverArrivedRecord> = self
            .never_arrived
            .drain()
            .map(|(id, sent_ns)| NeverArrivedRecord { id, sent_ns })
            .collect();
        never_arrived.sort_unstable_by_key(|r| r.id);

        let mut arrived_too_late = std::mem::take(&mut self.arrived_too_late);
        arrived_too_late.sort_unstable_by_key(|r| r.id);

        ReconcileReport {
            arrived,
            never_arrived,
            arrived_too_late,
            anomalies: std::mem::take(&mut self.anomalies),
            pending: self.ledger.len(),
        }
    }

    fn promote_or_reject(
        &mut self,
        id: u64,
        received_ns: u64,
        drained: usize,
        kind: AnomalyKind,
    ) -> Resolution {
        match self.never_arrived.remove(&id) {
            Some(sent_ns) => {
                let record = ArrivedRecord {
                    id,
                    sent_ns,
                    received_ns,
                };
                self.arrived_too_late.push(record);
                Resolution {
                    outcome: Outcome::ArrivedTooLate(record),
                    drained,
                }
            }
            None => self.anomaly(kind, id, drained),
        }
    }

    fn anomaly(&mut self, kind: AnomalyKind, id: u64, drained: usize) -> Resolution {
        self.anomalies.record(kind);
        debug!(id, kind = %kind, "unmatched arrival");
        Resolution {
            outcome: Outcome::Anomaly(kind),
            drained,
        }
    }
}
