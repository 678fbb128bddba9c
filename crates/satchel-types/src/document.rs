//! Document model: immutable record shape plus causal metadata.
//!
//! A document carries a primary key (`_id`), a revision string (`_rev`),
//! a wall-clock update timestamp (`_updatedAt`), an optional tombstone
//! marker (`_deleted`), an optional vector clock (`_vclock`), and an
//! arbitrary JSON object payload flattened alongside the reserved fields.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use std::fmt;
use std::str::FromStr;

use crate::prelude::*;
use crate::vclock::{Causality, VectorClock};

/// Maximum byte length of a document id.
pub const MAX_ID_BYTES: usize = 256;

/// Maximum serialized payload size (16 MiB).
pub const MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

/// Keys rejected anywhere in an ingested payload and in field paths.
pub const FORBIDDEN_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Reserved metadata field names.
pub const RESERVED_FIELDS: [&str; 5] = ["_id", "_rev", "_updatedAt", "_deleted", "_vclock"];

/// Document revision: `"<sequence>-<hash>"`, monotonic per document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
	pub sequence: u64,
	pub hash: Box<str>,
}

impl Revision {
	/// First revision of a document.
	pub fn first(hash: impl Into<Box<str>>) -> Self {
		Self { sequence: 1, hash: hash.into() }
	}

	/// Successor revision with a new content hash.
	pub fn next(&self, hash: impl Into<Box<str>>) -> Self {
		Self { sequence: self.sequence.saturating_add(1), hash: hash.into() }
	}
}

impl fmt::Display for Revision {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}", self.sequence, self.hash)
	}
}

impl FromStr for Revision {
	type Err = Error;

	fn from_str(s: &str) -> DbResult<Self> {
		let (seq, hash) = s
			.split_once('-')
			.ok_or_else(|| Error::ValidationError(format!("malformed revision: {}", s)))?;
		let sequence = seq
			.parse::<u64>()
			.map_err(|_| Error::ValidationError(format!("malformed revision sequence: {}", s)))?;
		if sequence == 0 || hash.is_empty() {
			return Err(Error::ValidationError(format!("malformed revision: {}", s)));
		}
		Ok(Self { sequence, hash: hash.into() })
	}
}

// Revisions persist as their joined string so they round-trip verbatim
// across storage boundaries.
impl Serialize for Revision {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for Revision {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// A stored document: reserved metadata plus a dynamic payload.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
	#[serde(rename = "_id")]
	pub id: Box<str>,

	#[serde(rename = "_rev")]
	pub rev: Revision,

	#[serde(rename = "_updatedAt")]
	pub updated_at: Timestamp,

	/// Tombstone marker; omitted from the wire when false.
	#[serde(rename = "_deleted", default, skip_serializing_if = "std::ops::Not::not")]
	pub deleted: bool,

	#[serde(rename = "_vclock")]
	pub vclock: Option<VectorClock>,

	/// User payload, flattened alongside the reserved fields.
	#[serde(flatten)]
	pub data: Map<String, Value>,
}

impl Document {
	pub fn is_tombstone(&self) -> bool {
		self.deleted
	}

	/// Tombstone for this document: metadata only, payload dropped.
	///
	/// The vector clock is carried over only when the live document had one;
	/// deletes do not establish a clock for the tombstone.
	pub fn tombstone(&self, rev: Revision, updated_at: Timestamp) -> Document {
		Document {
			id: self.id.clone(),
			rev,
			updated_at,
			deleted: true,
			vclock: self.vclock.clone(),
			data: Map::new(),
		}
	}

	/// Resolve a dot-separated field path against this document.
	///
	/// Reserved metadata fields resolve to their JSON representations;
	/// everything else walks the payload. Missing intermediates and
	/// forbidden path segments resolve to `None`.
	pub fn field(&self, path: &str) -> Option<Value> {
		match path {
			"_id" => return Some(Value::String(self.id.to_string())),
			"_rev" => return Some(Value::String(self.rev.to_string())),
			"_updatedAt" => return Some(Value::Number(self.updated_at.0.into())),
			"_deleted" => return Some(Value::Bool(self.deleted)),
			_ => {}
		}

		let segments = parse_field_path(path).ok()?;
		let mut current: Option<&Value> = None;
		for (i, segment) in segments.iter().enumerate() {
			current = if i == 0 {
				self.data.get(*segment)
			} else {
				current?.as_object()?.get(*segment)
			};
		}
		current.cloned()
	}
}

/// Split a dot path into segments, rejecting empty and forbidden segments.
pub fn parse_field_path(path: &str) -> DbResult<Vec<&str>> {
	if path.is_empty() {
		return Err(Error::ValidationError("empty field path".to_string()));
	}
	let segments: Vec<&str> = path.split('.').collect();
	for segment in &segments {
		if segment.is_empty() {
			return Err(Error::ValidationError(format!("empty segment in field path: {}", path)));
		}
		if FORBIDDEN_KEYS.contains(segment) {
			return Err(Error::ValidationError(format!(
				"forbidden segment in field path: {}",
				path
			)));
		}
	}
	Ok(segments)
}

/// Validate a document id: non-empty, at most 256 bytes, no NUL bytes.
pub fn validate_id(id: &str) -> DbResult<()> {
	if id.is_empty() {
		return Err(Error::ValidationError("document id must not be empty".to_string()));
	}
	if id.len() > MAX_ID_BYTES {
		return Err(Error::ValidationError(format!(
			"document id exceeds {} bytes",
			MAX_ID_BYTES
		)));
	}
	if id.contains('\0') {
		return Err(Error::ValidationError("document id contains NUL byte".to_string()));
	}
	Ok(())
}

/// Validate an ingested payload: forbidden keys anywhere, size cap.
pub fn validate_payload(payload: &Map<String, Value>) -> DbResult<()> {
	check_forbidden_keys(payload)?;

	let size = serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(0);
	if size > MAX_DOCUMENT_BYTES {
		return Err(Error::ValidationError(format!(
			"document exceeds {} bytes",
			MAX_DOCUMENT_BYTES
		)));
	}
	Ok(())
}

fn check_forbidden_keys(obj: &Map<String, Value>) -> DbResult<()> {
	for (key, value) in obj {
		if FORBIDDEN_KEYS.contains(&key.as_str()) {
			return Err(Error::ValidationError(format!("forbidden key: {}", key)));
		}
		check_forbidden_keys_value(value)?;
	}
	Ok(())
}

fn check_forbidden_keys_value(value: &Value) -> DbResult<()> {
	match value {
		Value::Object(obj) => check_forbidden_keys(obj),
		Value::Array(arr) => {
			for item in arr {
				check_forbidden_keys_value(item)?;
			}
			Ok(())
		}
		_ => Ok(()),
	}
}

/// Causal order of two document versions.
///
/// Uses vector clocks when both versions carry one, otherwise falls back to
/// `_updatedAt`.
pub fn causal_order(a: &Document, b: &Document) -> Causality {
	if let (Some(ca), Some(cb)) = (&a.vclock, &b.vclock) {
		return ca.compare(cb);
	}
	match a.updated_at.cmp(&b.updated_at) {
		std::cmp::Ordering::Less => Causality::Before,
		std::cmp::Ordering::Greater => Causality::After,
		std::cmp::Ordering::Equal => Causality::Equal,
	}
}

/// Detect a conflict between two versions of the same document.
///
/// With clocks this is clock concurrency; without, two versions at the same
/// revision sequence with different hashes diverged.
pub fn in_conflict(a: &Document, b: &Document) -> bool {
	if let (Some(ca), Some(cb)) = (&a.vclock, &b.vclock) {
		return ca.compare(cb) == Causality::Concurrent;
	}
	a.rev.sequence == b.rev.sequence && a.rev.hash != b.rev.hash
}


// vim: ts=4
