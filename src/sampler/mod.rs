//! Periodic host CPU and memory sampling.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;

/// One point of the resource trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// Milliseconds since the sampler started.
    pub elapsed_ms: u64,
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Source of host utilization readings.
pub trait ResourceProbe: Send + 'static {
    /// Current `(cpu_percent, memory_percent)`.
    fn sample(&mut self) -> Result<(f32, f32)>;
}

/// Reads utilization from procfs.
///
/// CPU usage is the busy share of jiffies since the previous reading, so the
/// first sample covers the time since the probe was created.
pub struct ProcProbe {
    prev: CpuTimes,
}

impl ProcProbe {
    pub fn new() -> Self {
        let prev = read_cpu_times().unwrap_or_else(|e| {
            debug!(error = %e, "no initial cpu reading");
            CpuTimes::default()
        });
        Self { prev }
    }
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for ProcProbe {
    fn sample(&mut self) -> Result<(f32, f32)> {
        let cur = read_cpu_times()?;
        let cpu = cpu_percent(self.prev, cur);
        self.prev = cur;

        let meminfo = fs::read_to_string("/proc/meminfo").context("reading /proc/meminfo")?;
        let memory = parse_memory_percent(&meminfo).context("parsing /proc/meminfo")?;

        Ok((cpu, memory))
    }
}

/// Aggregate jiffy counters from the `cpu` line of /proc/stat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

fn read_cpu_times() -> Result<CpuTimes> {
    let stat = fs::read_to_string("/proc/stat").context("reading /proc/stat")?;
    parse_cpu_times(&stat).context("parsing /proc/stat")
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;

    // user nice system idle iowait irq softirq steal; guest time is already
    // counted in user.
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| v.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;

    if fields.len() < 4 {
        return None;
    }

    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);

    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn cpu_percent(prev: CpuTimes, cur: CpuTimes) -> f32 {
    let total = cur.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let busy = cur.busy.saturating_sub(prev.busy);
    (busy as f64 / total as f64 * 100.0) as f32
}

fn parse_memory_percent(meminfo: &str) -> Option<f32> {
    let mut total = None;
    let mut available = None;

    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.split_whitespace().next()?.parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.split_whitespace().next()?.parse::<u64>().ok();
        }
    }

    let total = total.filter(|t| *t > 0)?;
    let used = total.saturating_sub(available?);
    Some((used as f64 / total as f64 * 100.0) as f32)
}

/// Samples a [`ResourceProbe`] on a fixed interval until cancelled.
pub struct ResourceSampler<P> {
    interval: Duration,
    probe: P,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<P: ResourceProbe> ResourceSampler<P> {
    pub fn new(interval: Duration, probe: P) -> Self {
        Self {
            interval,
            probe,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawn the sampling task. The trace is returned through the handle once
    /// `cancel` fires; a failed reading is logged and skipped.
    ///
    /// Sample times are measured from the moment the sampler is spawned.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<Vec<ResourceSample>> {
        let started = tokio::time::Instant::now();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(started + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut trace = Vec::new();
            let mut failures = 0u64;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.probe.sample() {
                            Ok((cpu_percent, memory_percent)) => {
                                if let Some(metrics) = &self.metrics {
                                    metrics.cpu_usage.set(f64::from(cpu_percent));
                                    metrics.memory_usage.set(f64::from(memory_percent));
                                }
                                trace.push(ResourceSample {
                                    elapsed_ms: started.elapsed().as_millis() as u64,
                                    cpu_percent,
                                    memory_percent,
                                });
                            }
                            Err(e) => {
                                failures += 1;
                                warn!(error = %e, "resource sample failed");
                            }
                        }
                    }
                }
            }

            debug!(samples = trace.len(), failures, "resource sampler stopped");

            trace
        })
    }
}
