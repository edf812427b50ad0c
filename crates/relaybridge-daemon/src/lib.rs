//! relaybridge daemon library
//!
//! Runtime pieces of the bridge:
//! - Worker process supervision and output pumping
//! - Observer/controller connection registry with broadcast fan-out
//! - Reconnecting upstream link
//! - axum WebSocket endpoint and status API
//! - The `Bridge` coordinator tying them together

pub mod registry;
pub mod relay;
pub mod server;
pub mod subprocess;
pub mod upstream;
