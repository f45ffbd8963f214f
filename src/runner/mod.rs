//! Run orchestration: wires the transport, reconciler, emitter and sampler
//! together and drives one benchmark run to completion.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::emitter::{EmitReport, Emitter};
use crate::error::TransportError;
use crate::export::health::HealthMetrics;
use crate::payload::PayloadFactory;
use crate::reconcile::summary::RunSummary;
use crate::reconcile::{AnomalyKind, ReconcileReport, Reconciler};
use crate::sampler::{ProcProbe, ResourceProbe, ResourceSample, ResourceSampler};
use crate::transport::{self, Notification, Transport};

/// Upper bound on ledger pre-allocation; longer runs grow on demand.
const MAX_PREALLOCATED: u64 = 1 << 20;

/// How often progress is logged while the emitter runs.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: ReconcileReport,
    pub resource_trace: Vec<ResourceSample>,
    /// Ids issued to the ledger, including one whose send failed.
    pub sent: u64,
    /// Present when the emitter completed without a transport error.
    pub emit: Option<EmitReport>,
    /// The send failure that halted the emitter, if any.
    pub emit_error: Option<TransportError>,
    pub summary: RunSummary,
}

/// Drives a single benchmark run.
pub struct Runner {
    cfg: Config,
    clock: Clock,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
}

impl Runner {
    /// Creates a new runner, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate().context("validating config")?;

        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            clock: Clock::new(),
            health,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops the emitter early. The grace period and sweep still
    /// run so the datasets stay complete.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Open the configured transport and run against it, sampling host
    /// resources from procfs.
    ///
    /// Transport and health server setup failures abort before any message
    /// is sent.
    pub async fn run(&self) -> Result<RunOutcome> {
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        let transport = transport::open(&self.cfg.transport, self.clock)
            .with_context(|| format!("opening {} transport", self.cfg.transport.kind.as_str()))?;

        let payload = PayloadFactory::new(self.cfg.payload.kind);
        let outcome = self.run_with(transport, ProcProbe::new(), payload).await;

        self.health.stop().await?;

        outcome
    }

    /// Run against an already opened transport.
    pub async fn run_with<P: ResourceProbe>(
        &self,
        transport: Arc<dyn Transport>,
        probe: P,
        mut payload: PayloadFactory,
    ) -> Result<RunOutcome> {
        let count = self.cfg.message_count()?;
        let rate = self.cfg.rate_controller()?;

        let reconciler = Arc::new(Mutex::new(Reconciler::with_capacity(
            count.min(MAX_PREALLOCATED) as usize,
        )));

        // Arrivals are timestamped on the receive thread, then queued for a
        // single consumer so reconciliation never blocks a socket read.
        let (tx, rx) = mpsc::unbounded_channel::<Notification>();
        let subscription = transport
            .subscribe(Arc::new(move |notification| {
                let _ = tx.send(notification);
            }))
            .context("subscribing to arrivals")?;

        let consumer = spawn_consumer(rx, Arc::clone(&reconciler), Arc::clone(&self.health));

        let sampler_cancel = CancellationToken::new();
        let sampler = ResourceSampler::new(self.cfg.sampler.interval, probe)
            .with_metrics(Arc::clone(&self.health))
            .spawn(sampler_cancel.clone());

        let progress_cancel = CancellationToken::new();
        self.spawn_progress_reporter(Arc::clone(&reconciler), progress_cancel.clone());

        info!(
            count,
            transport = transport.name(),
            payload = payload.kind().as_str(),
            grace_period = ?self.cfg.run.grace_period,
            "run started",
        );

        let mut emitter = Emitter::new(
            rate,
            self.clock,
            Arc::clone(&reconciler),
            self.cancel.child_token(),
        )
        .with_metrics(Arc::clone(&self.health));
        if let Some(duration) = self.cfg.run.duration {
            emitter = emitter.with_deadline(duration);
        }

        let emit_transport = Arc::clone(&transport);
        let emit_result = tokio::task::spawn_blocking(move || {
            emitter.run(count, |_| payload.build(), emit_transport.as_ref())
        })
        .await
        .context("emitter thread panicked")?;

        let (emit, emit_error) = match emit_result {
            Ok(report) => (Some(report), None),
            Err(e) => {
                error!(error = %e, "emitter halted by transport error");
                (None, Some(e))
            }
        };
        progress_cancel.cancel();

        debug!(grace_period = ?self.cfg.run.grace_period, "waiting for late arrivals");
        tokio::time::sleep(self.cfg.run.grace_period).await;

        let swept = reconciler.lock().sweep();
        self.health.messages_drained.inc_by(swept as f64);
        self.health.ledger_depth.set(0.0);
        info!(swept, "grace period over, unresolved messages declared lost");

        sampler_cancel.cancel();
        let resource_trace = sampler.await.context("sampler task panicked")?;

        tokio::task::spawn_blocking(move || subscription.dispose())
            .await
            .context("disposing arrival subscription")?;

        // The channel closes once the receive thread has dropped its handler.
        if let Err(e) = consumer.await {
            warn!(error = %e, "arrival consumer task failed");
        }

        let (sent, report) = {
            let mut reconciler = reconciler.lock();
            (reconciler.issued(), reconciler.take_report())
        };

        let summary = RunSummary::new(sent, &report);
        summary.log(&report);

        Ok(RunOutcome {
            report,
            resource_trace,
            sent,
            emit,
            emit_error,
            summary,
        })
    }

    /// Spawn background progress reporter for the sending phase.
    fn spawn_progress_reporter(
        &self,
        reconciler: Arc<Mutex<Reconciler>>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + PROGRESS_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, PROGRESS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let (issued, pending, arrived, never_arrived, arrived_too_late) = {
                            let r = reconciler.lock();
                            (
                                r.issued(),
                                r.pending(),
                                r.arrived_count(),
                                r.never_arrived_count(),
                                r.arrived_too_late_count(),
                            )
                        };
                        info!(
                            issued,
                            pending,
                            arrived,
                            never_arrived,
                            arrived_too_late,
                            "run progress",
                        );
                    }
                }
            }
        });
    }
}

/// Feed queued notifications into the reconciler until every sender is gone.
fn spawn_consumer(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    reconciler: Arc<Mutex<Reconciler>>,
    health: Arc<HealthMetrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            match notification {
                Notification::Arrival(arrival) => {
                    health.arrived_bytes.inc_by(arrival.payload_len as f64);
                    let resolution = reconciler
                        .lock()
                        .on_arrival(arrival.id, arrival.received_ns);
                    health.observe_resolution(&resolution);
                }
                Notification::Undecodable { .. } => {
                    reconciler.lock().record_anomaly(AnomalyKind::Undecodable);
                    health.observe_anomaly(AnomalyKind::Undecodable);
                }
                Notification::ReceiveFailed => health.receive_errors.inc(),
            }
        }

        debug!("arrival consumer stopped");
    })
}
