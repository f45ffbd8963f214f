use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

/// Number of joints in velocity and trajectory payloads.
pub const JOINTS: usize = 6;

/// Points per trajectory payload.
pub const TRAJECTORY_POINTS: usize = 10;

/// Shape of the bytes carried by each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// No payload beyond the message header.
    Empty,
    /// One velocity command: 6 f64 values.
    #[default]
    Velocity,
    /// Joint trajectory: 10 points of 6 positions, 6 velocities and a
    /// `(seconds: u32, nanoseconds: u32)` time-from-start.
    Trajectory,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Velocity => "velocity",
            Self::Trajectory => "trajectory",
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Velocity => JOINTS * 8,
            Self::Trajectory => TRAJECTORY_POINTS * (2 * JOINTS * 8 + 8),
        }
    }
}

/// Builds randomized payloads for outgoing messages.
pub struct PayloadFactory {
    kind: PayloadKind,
    rng: StdRng,
}

impl PayloadFactory {
    pub fn new(kind: PayloadKind) -> Self {
        Self {
            kind,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic factory for tests and reproducible runs.
    pub fn seeded(kind: PayloadKind, seed: u64) -> Self {
        Self {
            kind,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    /// Build the next payload.
    pub fn build(&mut self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.kind.size());

        match self.kind {
            PayloadKind::Empty => {}
            PayloadKind::Velocity => self.push_joint_values(&mut buf),
            PayloadKind::Trajectory => {
                for _ in 0..TRAJECTORY_POINTS {
                    self.push_joint_values(&mut buf);
                    self.push_joint_values(&mut buf);
                    let seconds: u32 = self.rng.gen_range(0..=10);
                    let nanoseconds: u32 = self.rng.gen_range(0..=500_000);
                    buf.extend_from_slice(&seconds.to_le_bytes());
                    buf.extend_from_slice(&nanoseconds.to_le_bytes());
                }
            }
        }

        buf
    }

    fn push_joint_values(&mut self, buf: &mut Vec<u8>) {
        for _ in 0..JOINTS {
            let v: f64 = self.rng.gen_range(-5.0..5.0);
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

impl std::fmt::Debug for PayloadFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadFactory")
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_sizes() {
        for kind in [
            PayloadKind::Empty,
            PayloadKind::Velocity,
            PayloadKind::Trajectory,
        ] {
            let mut factory = PayloadFactory::seeded(kind, 7);
            assert_eq!(factory.build().len(), kind.size(), "kind={}", kind.as_str());
        }
    }

    #[test]
    fn test_velocity_values_in_range() {
        let mut factory = PayloadFactory::seeded(PayloadKind::Velocity, 1);
        let data = factory.build();

        for chunk in data.chunks_exact(8) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            let v = f64::from_le_bytes(raw);
            assert!((-5.0..5.0).contains(&v), "v={v}");
        }
    }

    #[test]
    fn test_seeded_factories_are_reproducible() {
        let mut a = PayloadFactory::seeded(PayloadKind::Trajectory, 99);
        let mut b = PayloadFactory::seeded(PayloadKind::Trajectory, 99);
        assert_eq!(a.build(), b.build());
    }

    #[test]
    fn test_payload_kind_from_yaml() {
        let kind: PayloadKind = serde_yaml::from_str("trajectory").expect("parse");
        assert_eq!(kind, PayloadKind::Trajectory);
        assert_eq!(PayloadKind::default(), PayloadKind::Velocity);
    }
}
