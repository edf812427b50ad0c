//! Worker process supervision.

pub mod manager;
pub mod reader;

pub use manager::{SupervisorError, WorkerSupervisor};
pub use reader::LineReader;
