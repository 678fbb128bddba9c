//! In-memory implementation of the Satchel `StoreAdapter`.
//!
//! The reference adapter: collections are `BTreeMap`s behind an async
//! `RwLock`, every mutation assigns a per-collection strictly increasing
//! sequence number and fans the change event out over a tokio broadcast
//! channel. It is also the single-process fallback and the test substrate
//! for the engine crates.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use satchel::change::ChangeEvent;
use satchel::document::{validate_id, validate_payload, Document, Revision};
use satchel::error::{DbResult, Error};
use satchel::merge::shallow_merge;
use satchel::store_adapter::{ChangeStream, IndexSpec, StoreAdapter, StoreStats};
use satchel::types::Timestamp;
use satchel::utils::payload_hash;
use satchel::vclock::VectorClock;

/// Adapter configuration options.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
	/// Broadcast channel capacity for change events.
	pub broadcast_capacity: usize,
}

impl Default for AdapterConfig {
	fn default() -> Self {
		Self { broadcast_capacity: 1024 }
	}
}

/// One collection's state.
struct CollectionState {
	docs: BTreeMap<Box<str>, Document>,
	sequence: u64,
	indexes: HashMap<Box<str>, IndexSpec>,
	change_tx: tokio::sync::broadcast::Sender<ChangeEvent>,
}

impl CollectionState {
	fn new(broadcast_capacity: usize) -> Self {
		let (change_tx, _) = tokio::sync::broadcast::channel(broadcast_capacity);
		Self { docs: BTreeMap::new(), sequence: 0, indexes: HashMap::new(), change_tx }
	}

	fn next_sequence(&mut self) -> u64 {
		self.sequence += 1;
		self.sequence
	}

	fn emit(&self, event: ChangeEvent) {
		// No receivers is fine; the event is simply dropped.
		let _ = self.change_tx.send(event);
	}
}

/// In-memory store adapter.
pub struct StoreAdapterMemory {
	collections: Arc<RwLock<HashMap<Box<str>, Arc<RwLock<CollectionState>>>>>,
	config: AdapterConfig,
}

impl Default for StoreAdapterMemory {
	fn default() -> Self {
		Self::new()
	}
}

impl StoreAdapterMemory {
	pub fn new() -> Self {
		Self::with_config(AdapterConfig::default())
	}

	pub fn with_config(config: AdapterConfig) -> Self {
		Self { collections: Arc::new(RwLock::new(HashMap::new())), config }
	}

	/// Get or create a collection's state.
	async fn collection(&self, name: &str) -> DbResult<Arc<RwLock<CollectionState>>> {
		validate_collection(name)?;

		// Fast path: already present
		{
			let collections = self.collections.read().await;
			if let Some(state) = collections.get(name) {
				return Ok(Arc::clone(state));
			}
		}

		let mut collections = self.collections.write().await;
		// Double-checked: another writer may have created it
		if let Some(state) = collections.get(name) {
			return Ok(Arc::clone(state));
		}

		let state = Arc::new(RwLock::new(CollectionState::new(self.config.broadcast_capacity)));
		collections.insert(name.into(), Arc::clone(&state));
		Ok(state)
	}

	/// Write path shared by put/bulk_put/patch: assigns the revision,
	/// stamps `_updatedAt`, and emits the change event.
	fn put_locked(
		state: &mut CollectionState,
		collection: &str,
		id: Box<str>,
		payload: Map<String, Value>,
		vclock: Option<VectorClock>,
	) -> DbResult<Document> {
		validate_payload(&payload)?;

		let hash = payload_hash(&payload);
		let previous = state.docs.get(&id).cloned();
		let rev = match &previous {
			Some(prev) => prev.rev.next(hash),
			None => Revision::first(hash),
		};
		let vclock = vclock.or_else(|| previous.as_ref().and_then(|p| p.vclock.clone()));

		let doc = Document {
			id: id.clone(),
			rev,
			updated_at: Timestamp::now(),
			deleted: false,
			vclock,
			data: payload,
		};
		state.docs.insert(id, doc.clone());

		let sequence = state.next_sequence();
		let timestamp = doc.updated_at;
		let event = match previous {
			Some(prev) => ChangeEvent::Update {
				collection: collection.into(),
				document: doc.clone(),
				previous: Some(prev),
				sequence,
				timestamp,
				is_from_sync: false,
			},
			None => ChangeEvent::Insert {
				collection: collection.into(),
				document: doc.clone(),
				sequence,
				timestamp,
				is_from_sync: false,
			},
		};
		state.emit(event);

		Ok(doc)
	}
}

/// Split an incoming JSON object into (id, vclock, payload), stripping the
/// store-managed reserved fields.
fn split_input(doc: Value) -> DbResult<(Box<str>, Option<VectorClock>, Map<String, Value>)> {
	let Value::Object(mut obj) = doc else {
		return Err(Error::ValidationError("document must be a JSON object".to_string()));
	};

	let id = match obj.remove("_id") {
		Some(Value::String(id)) => id,
		Some(_) => return Err(Error::ValidationError("_id must be a string".to_string())),
		None => return Err(Error::ValidationError("document is missing _id".to_string())),
	};
	validate_id(&id)?;

	let vclock = match obj.remove("_vclock") {
		Some(value) => Some(
			serde_json::from_value::<VectorClock>(value)
				.map_err(|e| Error::ValidationError(format!("malformed _vclock: {}", e)))?,
		),
		None => None,
	};

	// Store-managed fields are ignored on input.
	obj.remove("_rev");
	obj.remove("_updatedAt");
	obj.remove("_deleted");

	Ok((id.into(), vclock, obj))
}

fn validate_collection(name: &str) -> DbResult<()> {
	if name.is_empty() {
		return Err(Error::ValidationError("collection name must not be empty".to_string()));
	}
	if name.contains('\0') {
		return Err(Error::ValidationError("collection name contains NUL byte".to_string()));
	}
	Ok(())
}

#[async_trait]
impl StoreAdapter for StoreAdapterMemory {
	async fn get(&self, collection: &str, id: &str) -> DbResult<Option<Document>> {
		let state = self.collection(collection).await?;
		let state = state.read().await;
		Ok(state.docs.get(id).cloned())
	}

	async fn get_many(&self, collection: &str, ids: &[&str]) -> DbResult<Vec<Document>> {
		let state = self.collection(collection).await?;
		let state = state.read().await;
		Ok(ids.iter().filter_map(|id| state.docs.get(*id).cloned()).collect())
	}

	async fn get_all(&self, collection: &str) -> DbResult<Vec<Document>> {
		let state = self.collection(collection).await?;
		let state = state.read().await;
		Ok(state.docs.values().filter(|d| !d.is_tombstone()).cloned().collect())
	}

	async fn put(&self, collection: &str, doc: Value) -> DbResult<Document> {
		let (id, vclock, payload) = split_input(doc)?;
		let state = self.collection(collection).await?;
		let mut state = state.write().await;
		Self::put_locked(&mut state, collection, id, payload, vclock)
	}

	async fn bulk_put(&self, collection: &str, docs: Vec<Value>) -> DbResult<Vec<Document>> {
		let state = self.collection(collection).await?;
		let mut state = state.write().await;

		let mut written = Vec::with_capacity(docs.len());
		for doc in docs {
			let (id, vclock, payload) = split_input(doc)?;
			written.push(Self::put_locked(&mut state, collection, id, payload, vclock)?);
		}
		Ok(written)
	}

	async fn patch(&self, collection: &str, id: &str, patch: Value) -> DbResult<Document> {
		let Value::Object(patch) = patch else {
			return Err(Error::ValidationError("patch must be a JSON object".to_string()));
		};

		let state = self.collection(collection).await?;
		let mut state = state.write().await;

		let existing = state
			.docs
			.get(id)
			.filter(|d| !d.is_tombstone())
			.ok_or_else(|| Error::NotFound(format!("{}/{}", collection, id)))?;

		let mut payload = existing.data.clone();
		let vclock = existing.vclock.clone();
		shallow_merge(&mut payload, &patch)?;

		Self::put_locked(&mut state, collection, id.into(), payload, vclock)
	}

	async fn delete(&self, collection: &str, id: &str) -> DbResult<Option<Document>> {
		let state = self.collection(collection).await?;
		let mut state = state.write().await;

		let Some(existing) = state.docs.get(id).filter(|d| !d.is_tombstone()).cloned() else {
			return Ok(None);
		};

		let now = Timestamp::now();
		let tombstone = existing.tombstone(existing.rev.next(payload_hash(&Map::new())), now);
		state.docs.insert(tombstone.id.clone(), tombstone.clone());

		let sequence = state.next_sequence();
		state.emit(ChangeEvent::Delete {
			collection: collection.into(),
			document_id: tombstone.id.clone(),
			previous: Some(existing),
			sequence,
			timestamp: now,
			is_from_sync: false,
		});

		Ok(Some(tombstone))
	}

	async fn bulk_delete(&self, collection: &str, ids: &[&str]) -> DbResult<Vec<Document>> {
		let mut tombstones = Vec::new();
		for id in ids {
			if let Some(tombstone) = self.delete(collection, id).await? {
				tombstones.push(tombstone);
			}
		}
		Ok(tombstones)
	}

	async fn compact(&self, collection: &str) -> DbResult<u64> {
		let state = self.collection(collection).await?;
		let mut state = state.write().await;

		let before = state.docs.len();
		state.docs.retain(|_, doc| !doc.is_tombstone());
		Ok((before - state.docs.len()) as u64)
	}

	async fn count(&self, collection: &str) -> DbResult<u64> {
		let state = self.collection(collection).await?;
		let state = state.read().await;
		Ok(state.docs.values().filter(|d| !d.is_tombstone()).count() as u64)
	}

	async fn clear(&self, collection: &str) -> DbResult<()> {
		let state = self.collection(collection).await?;
		let mut state = state.write().await;
		// Sequence is preserved: it is monotonic for the collection's
		// lifetime, not for its contents.
		state.docs.clear();
		Ok(())
	}

	async fn create_index(&self, collection: &str, spec: IndexSpec) -> DbResult<()> {
		satchel::document::parse_field_path(&spec.field)?;

		let state = self.collection(collection).await?;
		let mut state = state.write().await;
		if state.indexes.contains_key(&spec.name) {
			return Err(Error::ValidationError(format!("index already exists: {}", spec.name)));
		}
		state.indexes.insert(spec.name.clone(), spec);
		Ok(())
	}

	async fn drop_index(&self, collection: &str, name: &str) -> DbResult<()> {
		let state = self.collection(collection).await?;
		let mut state = state.write().await;
		state
			.indexes
			.remove(name)
			.map(|_| ())
			.ok_or_else(|| Error::NotFound(format!("index {}", name)))
	}

	async fn stats(&self, collection: &str) -> DbResult<StoreStats> {
		let state = self.collection(collection).await?;
		let state = state.read().await;

		let tombstone_count = state.docs.values().filter(|d| d.is_tombstone()).count() as u64;
		Ok(StoreStats {
			document_count: state.docs.len() as u64 - tombstone_count,
			tombstone_count,
			last_sequence: state.sequence,
		})
	}

	async fn changes(&self, collection: &str) -> DbResult<ChangeStream> {
		let state = self.collection(collection).await?;
		let mut rx = {
			let state = state.read().await;
			state.change_tx.subscribe()
		};
		let name = collection.to_string();

		let stream = async_stream::stream! {
			loop {
				match rx.recv().await {
					Ok(event) => yield event,
					Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
						warn!("change stream for '{}' lagged, missed {} events", name, n);
						continue;
					}
					Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
				}
			}
		};

		Ok(Box::pin(stream))
	}
}


// vim: ts=4
