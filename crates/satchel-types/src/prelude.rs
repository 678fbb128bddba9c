//! Common imports for Satchel crates.

pub use crate::error::{DbResult, Error};
pub use crate::types::Timestamp;

pub use tracing::{debug, error, info, trace, warn};

// vim: ts=4
