//! Common imports for applications built on Satchel.

pub use satchel_types::error::{DbResult, Error};
pub use satchel_types::types::Timestamp;

pub use tracing::{debug, error, info, trace, warn};

// vim: ts=4
