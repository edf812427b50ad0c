//! Outbound link to the upstream aggregator.

pub mod client;
pub mod config;
pub mod error;

pub use client::{LinkState, UpstreamLink};
pub use config::{ReconnectPolicy, UpstreamConfig};
pub use error::UpstreamError;
