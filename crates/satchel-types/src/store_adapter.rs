//! Adapter trait for document stores.
//!
//! The engine crates consume this capability; concrete adapters (in-memory,
//! IndexedDB, SQLite wrappers) implement it. Stores MUST emit `Insert` for
//! new ids and `Update` for existing ones with `previous` populated, assign
//! a strictly increasing per-collection sequence to every event, and
//! preserve revision strings verbatim across persistence boundaries.

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

use crate::change::ChangeEvent;
use crate::document::Document;
use crate::error::DbResult;

/// Stream of change events for one collection.
pub type ChangeStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// Single-field equality index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
	pub name: Box<str>,
	pub field: Box<str>,
}

/// Collection statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
	/// Live (non-tombstone) documents.
	pub document_count: u64,
	pub tombstone_count: u64,
	pub last_sequence: u64,
}

/// Capability consumed by the query, view and sync engines.
///
/// Writes take raw JSON objects carrying `_id`; the store owns revision
/// assignment, `_updatedAt` stamping, and tombstone lifecycle. Reserved
/// fields other than `_id` and `_vclock` in the input are ignored.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
	async fn get(&self, collection: &str, id: &str) -> DbResult<Option<Document>>;

	async fn get_many(&self, collection: &str, ids: &[&str]) -> DbResult<Vec<Document>>;

	/// All live documents of a collection; tombstones are excluded.
	async fn get_all(&self, collection: &str) -> DbResult<Vec<Document>>;

	/// Insert or replace a document, incrementing its revision.
	async fn put(&self, collection: &str, doc: Value) -> DbResult<Document>;

	async fn bulk_put(&self, collection: &str, docs: Vec<Value>) -> DbResult<Vec<Document>>;

	/// Shallow-merge a patch into an existing document (see `merge`).
	async fn patch(&self, collection: &str, id: &str, patch: Value) -> DbResult<Document>;

	/// Soft-delete: the document becomes a tombstone retaining only causal
	/// metadata. Returns the tombstone, or `None` when nothing was deleted.
	async fn delete(&self, collection: &str, id: &str) -> DbResult<Option<Document>>;

	async fn bulk_delete(&self, collection: &str, ids: &[&str]) -> DbResult<Vec<Document>>;

	/// Drop tombstones, completing the two-phase delete. Returns how many
	/// were removed.
	async fn compact(&self, collection: &str) -> DbResult<u64>;

	/// Live document count.
	async fn count(&self, collection: &str) -> DbResult<u64>;

	/// Remove every document of the collection without emitting events.
	/// The collection's sequence counter is preserved.
	async fn clear(&self, collection: &str) -> DbResult<()>;

	async fn create_index(&self, collection: &str, spec: IndexSpec) -> DbResult<()>;

	async fn drop_index(&self, collection: &str, name: &str) -> DbResult<()>;

	async fn stats(&self, collection: &str) -> DbResult<StoreStats>;

	/// Subscribe to future change events of a collection.
	async fn changes(&self, collection: &str) -> DbResult<ChangeStream>;
}

// vim: ts=4
