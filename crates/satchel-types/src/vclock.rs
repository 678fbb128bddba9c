//! Vector clocks for causal ordering of document versions.
//!
//! A clock maps node identifiers to event counters. Comparing two clocks
//! examines every key in the union of their domains (absent keys count as
//! zero); merging takes the per-key maximum.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causal relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
	/// `self` happened before the other clock.
	Before,
	/// `self` happened after the other clock.
	After,
	Equal,
	/// Neither dominates the other: a conflict.
	Concurrent,
}

/// Per-node counter map used to detect causal vs. concurrent updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<Box<str>, u64>);

impl VectorClock {
	pub fn new() -> Self {
		Self::default()
	}

	/// Counter for `node`, zero when absent.
	pub fn get(&self, node: &str) -> u64 {
		self.0.get(node).copied().unwrap_or(0)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Record one more event on `node`.
	pub fn increment(&mut self, node: &str) {
		let counter = self.0.entry(node.into()).or_insert(0);
		*counter = counter.saturating_add(1);
	}

	pub fn set(&mut self, node: &str, counter: u64) {
		self.0.insert(node.into(), counter);
	}

	/// Componentwise maximum of the two clocks.
	pub fn merge(&self, other: &VectorClock) -> VectorClock {
		let mut merged = self.0.clone();
		for (node, &counter) in &other.0 {
			let entry = merged.entry(node.clone()).or_insert(0);
			*entry = (*entry).max(counter);
		}
		VectorClock(merged)
	}

	/// Compare two clocks over the union of their domains.
	pub fn compare(&self, other: &VectorClock) -> Causality {
		let mut less = false;
		let mut greater = false;

		for node in self.0.keys().chain(other.0.keys()) {
			let a = self.get(node);
			let b = other.get(node);
			if a < b {
				less = true;
			} else if a > b {
				greater = true;
			}
		}

		match (less, greater) {
			(false, false) => Causality::Equal,
			(true, false) => Causality::Before,
			(false, true) => Causality::After,
			(true, true) => Causality::Concurrent,
		}
	}

	pub fn nodes(&self) -> impl Iterator<Item = &str> {
		self.0.keys().map(AsRef::as_ref)
	}
}

impl<const N: usize> From<[(&str, u64); N]> for VectorClock {
	fn from(entries: [(&str, u64); N]) -> Self {
		VectorClock(entries.into_iter().map(|(node, c)| (node.into(), c)).collect())
	}
}


// vim: ts=4
