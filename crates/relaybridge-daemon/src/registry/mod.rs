//! Observer connection registry and broadcast hub.
//!
//! Tracks every open observer-facing connection plus the single controller
//! slot, and fans events out to observers without ever waiting on a slow one.

mod connection;
mod hub;

pub use connection::{ConnectionId, ConnectionRegistry, DeliveryFailure, ObserverConnection, Role};
