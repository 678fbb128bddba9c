//! Tab identity and peer liveness tracking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use satchel_types::prelude::*;
use satchel_types::utils::random_id;

/// Identity of one running instance ("tab").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
	pub tab_id: Box<str>,
	pub created_at: Timestamp,
}

impl TabInfo {
	/// Election priority: older tabs win, so priority is the complement of
	/// the creation time.
	pub fn priority(&self) -> u64 {
		u64::MAX - self.created_at.0
	}
}

/// Assigns this instance its tab identity and tracks peer liveness as an
/// input to election and lock priorities.
#[derive(Debug)]
pub struct TabManager {
	info: TabInfo,
	peers: Mutex<HashMap<Box<str>, Timestamp>>,
}

impl Default for TabManager {
	fn default() -> Self {
		Self::new()
	}
}

impl TabManager {
	pub fn new() -> Self {
		let info = TabInfo { tab_id: format!("tab-{}", random_id()).into(), created_at: Timestamp::now() };
		Self::with_identity(info)
	}

	/// Construct with a fixed identity (deterministic setups and tests).
	pub fn with_identity(info: TabInfo) -> Self {
		Self { info, peers: Mutex::new(HashMap::new()) }
	}

	pub fn tab_id(&self) -> &str {
		&self.info.tab_id
	}

	pub fn this_tab(&self) -> TabInfo {
		self.info.clone()
	}

	pub fn priority(&self) -> u64 {
		self.info.priority()
	}

	/// Record that a peer was heard from just now.
	pub fn observe_peer(&self, tab_id: &str) {
		if tab_id == self.tab_id() {
			return;
		}
		if let Ok(mut peers) = self.peers.lock() {
			peers.insert(tab_id.into(), Timestamp::now());
		}
	}

	/// Tab ids of peers seen so far.
	pub fn peers(&self) -> Vec<Box<str>> {
		match self.peers.lock() {
			Ok(peers) => {
				let mut ids: Vec<Box<str>> = peers.keys().cloned().collect();
				ids.sort();
				ids
			}
			Err(_) => Vec::new(),
		}
	}

	/// Drop peers not heard from within `max_age_ms`. Returns how many were
	/// pruned.
	pub fn prune_stale(&self, max_age_ms: u64) -> usize {
		let now = Timestamp::now();
		match self.peers.lock() {
			Ok(mut peers) => {
				let before = peers.len();
				peers.retain(|_, seen| now.millis_since(*seen) < max_age_ms);
				before - peers.len()
			}
			Err(_) => 0,
		}
	}
}


// vim: ts=4
