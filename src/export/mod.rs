//! Outbound observability surfaces.

pub mod health;
