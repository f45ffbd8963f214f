//! Paced message generation.
//!
//! The emitter runs on a dedicated blocking thread: std sleeps honour the
//! sub-millisecond delays a ramped schedule reaches, where timer-wheel sleeps
//! would round up to the next millisecond.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::TransportError;
use crate::export::health::HealthMetrics;
use crate::rate::RateController;
use crate::reconcile::Reconciler;
use crate::transport::Transport;
use crate::wire::Message;

/// How often the emitter logs progress.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// What an emitter run did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmitReport {
    /// Messages handed to the transport.
    pub sent: u64,
    pub elapsed: Duration,
    /// Rate in effect when the loop stopped.
    pub final_rate_hz: f64,
    /// The loop stopped on the cancellation token.
    pub cancelled: bool,
    /// The loop stopped at the configured deadline.
    pub deadline_reached: bool,
}

/// Sends a bounded sequence of messages at the scheduled rate, recording each
/// id in the reconciler's ledger before it is sent.
pub struct Emitter {
    rate: RateController,
    clock: Clock,
    reconciler: Arc<Mutex<Reconciler>>,
    cancel: CancellationToken,
    deadline: Option<Duration>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl Emitter {
    pub fn new(
        rate: RateController,
        clock: Clock,
        reconciler: Arc<Mutex<Reconciler>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rate,
            clock,
            reconciler,
            cancel,
            deadline: None,
            metrics: None,
        }
    }

    /// Stop sending once this much time has elapsed since the run started.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Send ids `0..sequence_count`, blocking the calling thread.
    ///
    /// A send failure stops the loop and is returned as is. The failed id is
    /// already in the ledger and resolves as never-arrived at the sweep.
    pub fn run<F>(
        &self,
        sequence_count: u64,
        mut payload: F,
        transport: &dyn Transport,
    ) -> Result<EmitReport, TransportError>
    where
        F: FnMut(u64) -> Vec<u8>,
    {
        let started = Instant::now();
        let mut last_progress = started;
        let mut rate_hz = self.rate.start_hz();
        let mut sent = 0u64;
        let mut cancelled = false;
        let mut deadline_reached = false;

        info!(
            count = sequence_count,
            start_hz = self.rate.start_hz(),
            ramp_hz_per_second = self.rate.ramp_hz_per_second(),
            transport = transport.name(),
            "emitter started",
        );

        for id in 0..sequence_count {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let elapsed = started.elapsed();
            if self.deadline.is_some_and(|d| elapsed >= d) {
                deadline_reached = true;
                break;
            }

            let message = Message::new(id, payload(id));

            let depth = {
                let mut reconciler = self.reconciler.lock();
                reconciler.expect(id, self.clock.now_ns());
                reconciler.pending()
            };

            transport.send(&message)?;
            sent += 1;

            rate_hz = self.rate.rate_at(elapsed);
            if let Some(metrics) = &self.metrics {
                metrics.messages_sent.inc();
                metrics.send_rate.set(rate_hz);
                metrics.ledger_depth.set(depth as f64);
            }

            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                last_progress = Instant::now();
                debug!(sent, rate_hz, ledger_depth = depth, "emitter progress");
            }

            std::thread::sleep(self.rate.delay_at(elapsed));
        }

        let report = EmitReport {
            sent,
            elapsed: started.elapsed(),
            final_rate_hz: rate_hz,
            cancelled,
            deadline_reached,
        };

        info!(
            sent = report.sent,
            elapsed = ?report.elapsed,
            final_rate_hz = report.final_rate_hz,
            cancelled = report.cancelled,
            deadline_reached = report.deadline_reached,
            "emitter finished",
        );

        Ok(report)
    }
}
