//! Error types shared across the Satchel workspace.
//!
//! Contention and predicate failures are deliberately NOT errors: lock
//! acquisition under contention resolves to `false`, and filter evaluation
//! fails closed. The variants here cover the cases that are surfaced to
//! callers or captured into component state.

use std::fmt;

/// Result alias used across the workspace.
pub type DbResult<T> = Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	/// Malformed collection name, document id, field path, forbidden key,
	/// or oversize document.
	ValidationError(String),
	/// The underlying store or query executor failed. Live queries capture
	/// this into their state instead of propagating it.
	ExecutorError(String),
	/// A regex pattern was rejected by the safe-compile guard.
	UnsafeRegex(String),
	NotFound(String),
	/// The broadcast channel backing a cross-tab protocol is gone.
	ChannelClosed,
	Json(String),
	Io(std::io::Error),
	Internal(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::ValidationError(msg) => write!(f, "validation error: {}", msg),
			Error::ExecutorError(msg) => write!(f, "executor error: {}", msg),
			Error::UnsafeRegex(msg) => write!(f, "unsafe regex: {}", msg),
			Error::NotFound(msg) => write!(f, "not found: {}", msg),
			Error::ChannelClosed => write!(f, "broadcast channel closed"),
			Error::Json(msg) => write!(f, "json error: {}", msg),
			Error::Io(e) => write!(f, "io error: {}", e),
			Error::Internal(msg) => write!(f, "internal error: {}", msg),
		}
	}
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Self {
		Error::Json(e.to_string())
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Error::Io(e)
	}
}

// vim: ts=4
