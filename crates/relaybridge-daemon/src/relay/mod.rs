//! Bridge coordinator: owns the worker, the registry and the upstream link.

pub mod bridge;

pub use bridge::{Bridge, BridgeStatus};
