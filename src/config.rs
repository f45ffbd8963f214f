use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::payload::PayloadKind;
use crate::rate::RateController;

/// Top-level configuration for a benchmark run.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Transport selection and endpoints.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Send-rate schedule.
    #[serde(default)]
    pub rate: RateConfig,

    /// Run length and drain policy.
    #[serde(default)]
    pub run: RunConfig,

    /// Message payload shape.
    #[serde(default)]
    pub payload: PayloadConfig,

    /// Host resource sampling.
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Dataset output.
    #[serde(default)]
    pub output: OutputConfig,

    /// Prometheus health metrics server.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Which transport carries the benchmark stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process simulated peer.
    #[default]
    Loopback,
    /// UDP datagrams.
    Udp,
    /// A TCP stream each way.
    Tcp,
    /// Unix datagram sockets.
    Uds,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loopback => "loopback",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Uds => "uds",
        }
    }
}

/// Transport configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TransportConfig {
    /// Transport kind. Default: loopback.
    #[serde(default)]
    pub kind: TransportKind,

    /// UDP endpoints.
    #[serde(default)]
    pub udp: UdpConfig,

    /// TCP endpoints.
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Unix datagram socket paths.
    #[serde(default)]
    pub uds: UdsConfig,

    /// Simulated link behaviour for the loopback transport.
    #[serde(default)]
    pub loopback: LoopbackConfig,
}

/// UDP endpoint configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct UdpConfig {
    /// Local address arrivals are received on (e.g. "127.0.0.1:5556").
    #[serde(default)]
    pub listen: String,

    /// Peer address messages are sent to (e.g. "127.0.0.1:5555").
    #[serde(default)]
    pub peer: String,
}

/// TCP endpoint configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TcpConfig {
    /// Local address the returning stream is accepted on (e.g. "127.0.0.1:5556").
    #[serde(default)]
    pub listen: String,

    /// Peer address the outgoing stream connects to (e.g. "127.0.0.1:5555").
    #[serde(default)]
    pub peer: String,
}

/// Unix datagram socket configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct UdsConfig {
    /// Socket path the peer receives on; messages are sent here.
    #[serde(default)]
    pub send_path: String,

    /// Socket path bound locally; arrivals are received here.
    #[serde(default)]
    pub recv_path: String,
}

/// Loopback link simulation.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopbackConfig {
    /// Probability in [0, 1] that a message is dropped. Default: 0.
    #[serde(default)]
    pub drop_probability: f64,

    /// Probability in [0, 1] that a message is held back and delivered after
    /// its successor. Default: 0.
    #[serde(default)]
    pub reorder_probability: f64,

    /// Fixed one-way delivery delay. Default: 0s.
    #[serde(default = "default_loopback_delay", with = "humantime_serde")]
    pub delay: Duration,
}

/// Send-rate schedule configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateConfig {
    /// Starting rate in messages per second. Default: 100.
    #[serde(default = "default_start_hz")]
    pub start_hz: f64,

    /// Linear rate increase in Hz per second. Absent means constant rate.
    #[serde(default)]
    pub ramp_hz_per_second: Option<f64>,
}

/// Run length configuration. Exactly one of `message_count` and `duration`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Total messages to send.
    #[serde(default)]
    pub message_count: Option<u64>,

    /// Total send duration.
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,

    /// Wait after the last send before unresolved messages are declared
    /// lost. Default: 5s.
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
}

/// Payload configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PayloadConfig {
    /// Payload shape. Default: velocity.
    #[serde(default)]
    pub kind: PayloadKind,
}

/// Resource sampler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    /// Sampling interval. Default: 100ms.
    #[serde(default = "default_sampler_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Dataset output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Directory the CSV datasets are written to. Default: "benchmark".
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_loopback_delay() -> Duration {
    Duration::ZERO
}

fn default_start_hz() -> f64 {
    100.0
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_sampler_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("benchmark")
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            transport: TransportConfig::default(),
            rate: RateConfig::default(),
            run: RunConfig::default(),
            payload: PayloadConfig::default(),
            sampler: SamplerConfig::default(),
            output: OutputConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            drop_probability: 0.0,
            reorder_probability: 0.0,
            delay: default_loopback_delay(),
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            start_hz: default_start_hz(),
            ramp_hz_per_second: None,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            message_count: None,
            duration: None,
            grace_period: default_grace_period(),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: default_sampler_interval(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()
            .with_context(|| format!("validating config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_controller()?;

        match (self.run.message_count, self.run.duration) {
            (Some(0), None) => {
                return Err(ConfigError::ZeroValue {
                    field: "run.message_count",
                })
            }
            (None, Some(d)) if d.is_zero() => {
                return Err(ConfigError::ZeroValue {
                    field: "run.duration",
                })
            }
            (Some(_), None) | (None, Some(_)) => {}
            _ => return Err(ConfigError::RunLength),
        }

        if self.sampler.interval.is_zero() {
            return Err(ConfigError::ZeroValue {
                field: "sampler.interval",
            });
        }

        self.transport.validate()?;

        if self.health.enabled && self.health.addr.is_empty() {
            return Err(ConfigError::MissingEndpoint {
                kind: "health",
                field: "health.addr",
            });
        }

        Ok(())
    }

    /// Build the rate schedule described by `rate`.
    pub fn rate_controller(&self) -> Result<RateController, ConfigError> {
        RateController::ramping(
            self.rate.start_hz,
            self.rate.ramp_hz_per_second.unwrap_or(0.0),
        )
    }

    /// Number of messages the run sends: `message_count`, or the number the
    /// rate schedule emits over `duration`.
    pub fn message_count(&self) -> Result<u64, ConfigError> {
        match (self.run.message_count, self.run.duration) {
            (Some(count), None) => Ok(count),
            (None, Some(duration)) => Ok(self.rate_controller()?.messages_for_duration(duration)),
            _ => Err(ConfigError::RunLength),
        }
    }
}

impl TransportConfig {
    /// Validate the endpoints required by the selected kind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.kind {
            TransportKind::Loopback => {
                check_probability(
                    "transport.loopback.drop_probability",
                    self.loopback.drop_probability,
                )?;
                check_probability(
                    "transport.loopback.reorder_probability",
                    self.loopback.reorder_probability,
                )?;
            }
            TransportKind::Udp => {
                if self.udp.listen.is_empty() {
                    return Err(ConfigError::MissingEndpoint {
                        kind: "udp",
                        field: "transport.udp.listen",
                    });
                }
                if self.udp.peer.is_empty() {
                    return Err(ConfigError::MissingEndpoint {
                        kind: "udp",
                        field: "transport.udp.peer",
                    });
                }
            }
            TransportKind::Tcp => {
                if self.tcp.listen.is_empty() {
                    return Err(ConfigError::MissingEndpoint {
                        kind: "tcp",
                        field: "transport.tcp.listen",
                    });
                }
                if self.tcp.peer.is_empty() {
                    return Err(ConfigError::MissingEndpoint {
                        kind: "tcp",
                        field: "transport.tcp.peer",
                    });
                }
            }
            TransportKind::Uds => {
                if !cfg!(unix) {
                    return Err(ConfigError::UnsupportedTransport { kind: "uds" });
                }
                if self.uds.send_path.is_empty() {
                    return Err(ConfigError::MissingEndpoint {
                        kind: "uds",
                        field: "transport.uds.send_path",
                    });
                }
                if self.uds.recv_path.is_empty() {
                    return Err(ConfigError::MissingEndpoint {
                        kind: "uds",
                        field: "transport.uds.recv_path",
                    });
                }
            }
        }

        Ok(())
    }
}

fn check_probability(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidProbability { field, value });
    }
    Ok(())
}
