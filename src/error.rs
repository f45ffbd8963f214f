use std::io;

use thiserror::Error;

/// Invalid or incomplete configuration. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("rate.start_hz must be positive and finite, got {value}")]
    InvalidStartRate { value: f64 },

    #[error("rate.ramp_hz_per_second must be non-negative and finite, got {value}")]
    InvalidRamp { value: f64 },

    #[error("{field} is required for transport kind '{kind}'")]
    MissingEndpoint {
        kind: &'static str,
        field: &'static str,
    },

    #[error("{field} must be positive")]
    ZeroValue { field: &'static str },

    #[error("{field} must be within [0, 1], got {value}")]
    InvalidProbability { field: &'static str, value: f64 },

    #[error("exactly one of run.message_count or run.duration must be set")]
    RunLength,

    #[error("transport kind '{kind}' is not supported on this platform")]
    UnsupportedTransport { kind: &'static str },
}

/// Failure to open or use a transport endpoint.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("binding {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("connecting to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("sending message {id}: {source}")]
    Send {
        id: u64,
        #[source]
        source: io::Error,
    },

    #[error("message {id} truncated on send: wrote {written} of {expected} bytes")]
    ShortSend {
        id: u64,
        written: usize,
        expected: usize,
    },

    #[error("spawning receive thread: {0}")]
    Spawn(#[source] io::Error),
}
