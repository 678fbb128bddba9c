//! Change events emitted by document stores.
//!
//! Every mutation against a collection produces one event carrying the
//! current document image (absent on delete), the previous image when one
//! existed, a per-collection strictly increasing sequence number, and a
//! flag distinguishing local writes from replicated ones.

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::types::Timestamp;

/// Mutation kind, used where only the operation matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOp {
	Insert,
	Update,
	Delete,
}

/// A single mutation against a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum ChangeEvent {
	#[serde(rename_all = "camelCase")]
	Insert {
		collection: Box<str>,
		document: Document,
		sequence: u64,
		timestamp: Timestamp,
		is_from_sync: bool,
	},
	#[serde(rename_all = "camelCase")]
	Update {
		collection: Box<str>,
		document: Document,
		previous: Option<Document>,
		sequence: u64,
		timestamp: Timestamp,
		is_from_sync: bool,
	},
	#[serde(rename_all = "camelCase")]
	Delete {
		collection: Box<str>,
		document_id: Box<str>,
		previous: Option<Document>,
		sequence: u64,
		timestamp: Timestamp,
		is_from_sync: bool,
	},
}

impl ChangeEvent {
	pub fn operation(&self) -> ChangeOp {
		match self {
			ChangeEvent::Insert { .. } => ChangeOp::Insert,
			ChangeEvent::Update { .. } => ChangeOp::Update,
			ChangeEvent::Delete { .. } => ChangeOp::Delete,
		}
	}

	pub fn collection(&self) -> &str {
		match self {
			ChangeEvent::Insert { collection, .. }
			| ChangeEvent::Update { collection, .. }
			| ChangeEvent::Delete { collection, .. } => collection,
		}
	}

	pub fn document_id(&self) -> &str {
		match self {
			ChangeEvent::Insert { document, .. } | ChangeEvent::Update { document, .. } => {
				&document.id
			}
			ChangeEvent::Delete { document_id, .. } => document_id,
		}
	}

	/// Current document image; `None` on delete.
	pub fn document(&self) -> Option<&Document> {
		match self {
			ChangeEvent::Insert { document, .. } | ChangeEvent::Update { document, .. } => {
				Some(document)
			}
			ChangeEvent::Delete { .. } => None,
		}
	}

	/// Previous document image when one existed.
	pub fn previous(&self) -> Option<&Document> {
		match self {
			ChangeEvent::Insert { .. } => None,
			ChangeEvent::Update { previous, .. } | ChangeEvent::Delete { previous, .. } => {
				previous.as_ref()
			}
		}
	}

	pub fn sequence(&self) -> u64 {
		match self {
			ChangeEvent::Insert { sequence, .. }
			| ChangeEvent::Update { sequence, .. }
			| ChangeEvent::Delete { sequence, .. } => *sequence,
		}
	}

	pub fn timestamp(&self) -> Timestamp {
		match self {
			ChangeEvent::Insert { timestamp, .. }
			| ChangeEvent::Update { timestamp, .. }
			| ChangeEvent::Delete { timestamp, .. } => *timestamp,
		}
	}

	pub fn is_from_sync(&self) -> bool {
		match self {
			ChangeEvent::Insert { is_from_sync, .. }
			| ChangeEvent::Update { is_from_sync, .. }
			| ChangeEvent::Delete { is_from_sync, .. } => *is_from_sync,
		}
	}

	/// Copy of this event with `is_from_sync` forced on, used when replaying
	/// a peer tab's change locally.
	pub fn into_synced(mut self) -> ChangeEvent {
		match &mut self {
			ChangeEvent::Insert { is_from_sync, .. }
			| ChangeEvent::Update { is_from_sync, .. }
			| ChangeEvent::Delete { is_from_sync, .. } => *is_from_sync = true,
		}
		self
	}
}


// vim: ts=4
