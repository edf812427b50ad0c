//! Worker output events.
//!
//! Raw bytes from the worker's stdout/stderr are framed into lines by
//! [`LineFramer`], then each line is turned into exactly one [`Event`] by
//! [`classify`]. Messages arriving from the upstream aggregator are parsed
//! with [`parse_inbound`].

mod classifier;
mod framer;
mod inbound;
mod types;

pub use classifier::{OutputStream, STRUCTURED_PREFIX, classify, parse_structured};
pub use framer::LineFramer;
pub use inbound::{Inbound, parse_inbound};
pub use types::*;
