pub mod clock;
pub mod config;
pub mod emitter;
pub mod error;
pub mod export;
pub mod output;
pub mod payload;
pub mod peer;
pub mod rate;
pub mod reconcile;
pub mod runner;
pub mod sampler;
pub mod transport;
pub mod wire;
