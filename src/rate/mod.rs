use std::time::Duration;

use crate::error::ConfigError;

/// Send-rate schedule for the emitter.
///
/// The rate is a function of elapsed run time only:
/// `rate(t) = start_hz + ramp_hz_per_second * t`. A zero ramp is a constant
/// schedule. Callers re-evaluate on every iteration, so scheduling jitter
/// shifts the curve instead of compounding along it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateController {
    start_hz: f64,
    ramp_hz_per_second: f64,
}

impl RateController {
    /// Constant-rate schedule.
    pub fn constant(hz: f64) -> Result<Self, ConfigError> {
        Self::ramping(hz, 0.0)
    }

    /// Linearly ramping schedule starting at `start_hz`.
    pub fn ramping(start_hz: f64, ramp_hz_per_second: f64) -> Result<Self, ConfigError> {
        if !start_hz.is_finite() || start_hz <= 0.0 {
            return Err(ConfigError::InvalidStartRate { value: start_hz });
        }

        if !ramp_hz_per_second.is_finite() || ramp_hz_per_second < 0.0 {
            return Err(ConfigError::InvalidRamp {
                value: ramp_hz_per_second,
            });
        }

        Ok(Self {
            start_hz,
            ramp_hz_per_second,
        })
    }

    pub fn start_hz(&self) -> f64 {
        self.start_hz
    }

    pub fn ramp_hz_per_second(&self) -> f64 {
        self.ramp_hz_per_second
    }

    /// Target rate in messages per second after `elapsed`.
    pub fn rate_at(&self, elapsed: Duration) -> f64 {
        self.start_hz + self.ramp_hz_per_second * elapsed.as_secs_f64()
    }

    /// Delay until the next send after `elapsed`.
    pub fn delay_at(&self, elapsed: Duration) -> Duration {
        // start_hz > 0 and ramp >= 0, so the rate never reaches zero.
        Duration::from_secs_f64(1.0 / self.rate_at(elapsed))
    }

    /// Number of messages this schedule emits over `duration`.
    ///
    /// Each whole second `k` contributes `rate(k)` messages; a trailing partial
    /// second contributes its fraction of the next second's rate.
    pub fn messages_for_duration(&self, duration: Duration) -> u64 {
        let secs = duration.as_secs() as f64;
        let fraction = f64::from(duration.subsec_nanos()) / 1e9;

        let whole =
            secs * self.start_hz + self.ramp_hz_per_second * secs * (secs - 1.0).max(0.0) / 2.0;
        let partial = (self.start_hz + self.ramp_hz_per_second * secs) * fraction;

        (whole + partial).floor() as u64
    }
}
