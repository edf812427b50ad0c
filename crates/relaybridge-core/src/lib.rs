//! relaybridge core library
//!
//! Runtime-agnostic building blocks shared by the daemon:
//! - Line framing of raw worker output
//! - Event classification (`JSON_DATA:` structured lines vs. plain logs)
//! - Inbound message parsing for the upstream link
//! - Configuration loading and validation
//! - Common error types

pub mod config;
pub mod error;
pub mod event;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventKind, LineFramer, OutputStream, classify};
