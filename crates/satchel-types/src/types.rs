//! Core scalar types.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp in milliseconds since the Unix epoch.
#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
	/// Current wall-clock time.
	pub fn now() -> Self {
		let ms = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_millis();
		Self(u64::try_from(ms).unwrap_or(u64::MAX))
	}

	/// Milliseconds elapsed since `earlier`, zero if `earlier` is in the future.
	pub fn millis_since(self, earlier: Timestamp) -> u64 {
		self.0.saturating_sub(earlier.0)
	}

	pub fn saturating_add_millis(self, ms: u64) -> Self {
		Self(self.0.saturating_add(ms))
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}


// vim: ts=4
