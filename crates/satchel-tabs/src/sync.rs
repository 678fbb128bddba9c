//! Cross-tab change sync: broadcast local change events to sibling tabs,
//! replay peer changes locally, and answer snapshot requests from
//! late-joining tabs.
//!
//! Every envelope carries a `messageId`; re-deliveries within the
//! deduplication window are dropped by a bounded LRU with a sliding TTL.
//! Events replayed from peers are re-emitted with `isFromSync = true`, and
//! events that are themselves replicated are never re-broadcast, so changes
//! cannot loop between tabs.

use futures::StreamExt;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use satchel_types::change::ChangeEvent;
use satchel_types::channel::TabChannel;
use satchel_types::document::Document;
use satchel_types::prelude::*;
use satchel_types::store_adapter::StoreAdapter;
use satchel_types::utils::random_id;

/// Bound on remembered message ids.
const DEDUP_CAPACITY: usize = 1024;

/// Buffer for locally re-emitted events and snapshots.
const EVENTS_CHANNEL_CAPACITY: usize = 256;

/// Sync tuning knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
	/// Sliding TTL for message-id deduplication.
	pub deduplication_window: Duration,
	/// Prefix for the protocol's channel name.
	pub channel_prefix: Box<str>,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			deduplication_window: Duration::from_millis(5000),
			channel_prefix: "satchel".into(),
		}
	}
}

impl SyncConfig {
	/// Channel name for this protocol under the configured prefix.
	pub fn channel_name(&self) -> String {
		format!("{}:sync", self.channel_prefix)
	}
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncMessage {
	#[serde(rename_all = "camelCase")]
	Change { message_id: Box<str>, tab_id: Box<str>, event: ChangeEvent },
	#[serde(rename_all = "camelCase")]
	SyncRequest {
		message_id: Box<str>,
		tab_id: Box<str>,
		collection: Box<str>,
		since_sequence: u64,
	},
	#[serde(rename_all = "camelCase")]
	SyncResponse {
		message_id: Box<str>,
		tab_id: Box<str>,
		collection: Box<str>,
		documents: Vec<Document>,
	},
}

struct SyncInner {
	tab_id: Box<str>,
	config: SyncConfig,
	channel: Option<Arc<dyn TabChannel>>,
	/// Answers peer snapshot requests when present.
	store: Option<Arc<dyn StoreAdapter>>,
	seen: Mutex<LruCache<Box<str>, Timestamp>>,
	events_tx: tokio::sync::broadcast::Sender<ChangeEvent>,
	snapshots_tx: tokio::sync::broadcast::Sender<(Box<str>, Vec<Document>)>,
	destroyed: AtomicBool,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncInner {
	fn send(&self, msg: &SyncMessage) {
		let Some(channel) = &self.channel else { return };
		let value = match serde_json::to_value(msg) {
			Ok(value) => value,
			Err(e) => {
				warn!("failed to encode sync message: {}", e);
				return;
			}
		};
		if let Err(e) = channel.send(&value) {
			warn!("sync channel send failed: {}", e);
		}
	}

	/// Record a message id; true when it was already seen inside the
	/// window. Hits slide the TTL forward.
	fn is_duplicate(&self, message_id: &str) -> bool {
		let now = Timestamp::now();
		let window = self.config.deduplication_window.as_millis() as u64;
		let Ok(mut seen) = self.seen.lock() else { return false };

		let fresh = seen
			.get(message_id)
			.is_some_and(|at| now.millis_since(*at) < window);
		seen.put(message_id.into(), now);
		fresh
	}

	async fn handle_message(&self, msg: SyncMessage) {
		let (message_id, tab_id) = match &msg {
			SyncMessage::Change { message_id, tab_id, .. }
			| SyncMessage::SyncRequest { message_id, tab_id, .. }
			| SyncMessage::SyncResponse { message_id, tab_id, .. } => (message_id, tab_id),
		};
		if tab_id.as_ref() == self.tab_id.as_ref() || self.is_duplicate(message_id) {
			return;
		}

		match msg {
			SyncMessage::Change { event, .. } => {
				// Replayed locally as a replicated change.
				let _ = self.events_tx.send(event.into_synced());
			}
			SyncMessage::SyncRequest { tab_id, collection, since_sequence, .. } => {
				let Some(store) = &self.store else { return };
				let stats = match store.stats(&collection).await {
					Ok(stats) => stats,
					Err(e) => {
						warn!("sync request for '{}' failed: {}", collection, e);
						return;
					}
				};
				if stats.last_sequence <= since_sequence {
					// Nothing the requester has not already seen.
					return;
				}
				match store.get_all(&collection).await {
					Ok(documents) => {
						debug!(
							"answering sync request from {} for '{}' with {} documents",
							tab_id,
							collection,
							documents.len()
						);
						self.send(&SyncMessage::SyncResponse {
							message_id: random_id().into(),
							tab_id: self.tab_id.clone(),
							collection,
							documents,
						});
					}
					Err(e) => warn!("sync request for '{}' failed: {}", collection, e),
				}
			}
			SyncMessage::SyncResponse { collection, documents, .. } => {
				let _ = self.snapshots_tx.send((collection, documents));
			}
		}
	}
}

/// Broadcasts change events to peer tabs and replays theirs locally.
pub struct CrossTabSync {
	inner: Arc<SyncInner>,
}

impl CrossTabSync {
	pub fn new(
		tab_id: impl Into<Box<str>>,
		channel: Option<Arc<dyn TabChannel>>,
		store: Option<Arc<dyn StoreAdapter>>,
		config: SyncConfig,
	) -> Self {
		let (events_tx, _) = tokio::sync::broadcast::channel(EVENTS_CHANNEL_CAPACITY);
		let (snapshots_tx, _) = tokio::sync::broadcast::channel(EVENTS_CHANNEL_CAPACITY);
		let capacity = NonZeroUsize::new(DEDUP_CAPACITY).unwrap_or(NonZeroUsize::MIN);

		let inner = Arc::new(SyncInner {
			tab_id: tab_id.into(),
			config,
			channel,
			store,
			seen: Mutex::new(LruCache::new(capacity)),
			events_tx,
			snapshots_tx,
			destroyed: AtomicBool::new(false),
			tasks: Mutex::new(Vec::new()),
		});

		if let Some(channel) = &inner.channel {
			let mut stream = channel.subscribe();
			let rx_inner = Arc::clone(&inner);
			let handle = tokio::spawn(async move {
				while let Some(value) = stream.next().await {
					if rx_inner.destroyed.load(Ordering::Acquire) {
						break;
					}
					match serde_json::from_value::<SyncMessage>(value) {
						Ok(msg) => rx_inner.handle_message(msg).await,
						Err(e) => debug!("ignoring unparseable sync message: {}", e),
					}
				}
			});
			if let Ok(mut tasks) = inner.tasks.lock() {
				tasks.push(handle);
			}
		}

		Self { inner }
	}

	pub fn tab_id(&self) -> &str {
		&self.inner.tab_id
	}

	/// Broadcast a local change to peer tabs. Replicated events are not
	/// re-broadcast.
	pub fn broadcast_change(&self, event: &ChangeEvent) -> DbResult<()> {
		if event.is_from_sync() || self.inner.channel.is_none() {
			return Ok(());
		}
		let message_id: Box<str> = random_id().into();
		// Our own envelope counts as seen, so a loopback is dropped even
		// before the tab-id check.
		self.inner.is_duplicate(&message_id);
		self.inner.send(&SyncMessage::Change {
			message_id,
			tab_id: self.inner.tab_id.clone(),
			event: event.clone(),
		});
		Ok(())
	}

	/// Ask peers for documents of a collection past `since_sequence`.
	pub fn request_sync(&self, collection: &str, since_sequence: u64) {
		let message_id: Box<str> = random_id().into();
		self.inner.is_duplicate(&message_id);
		self.inner.send(&SyncMessage::SyncRequest {
			message_id,
			tab_id: self.inner.tab_id.clone(),
			collection: collection.into(),
			since_sequence,
		});
	}

	/// Peer change events, re-tagged with `isFromSync`.
	pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ChangeEvent> {
		self.inner.events_tx.subscribe()
	}

	/// Snapshots received in answer to sync requests.
	pub fn subscribe_snapshots(
		&self,
	) -> tokio::sync::broadcast::Receiver<(Box<str>, Vec<Document>)> {
		self.inner.snapshots_tx.subscribe()
	}

	/// Stop listening. Idempotent.
	pub fn destroy(&self) {
		if self.inner.destroyed.swap(true, Ordering::AcqRel) {
			return;
		}
		if let Ok(mut tasks) = self.inner.tasks.lock() {
			for task in tasks.drain(..) {
				task.abort();
			}
		}
	}
}

impl Drop for CrossTabSync {
	fn drop(&mut self) {
		self.destroy();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hub::ChannelHub;
	use satchel_store_adapter_memory::StoreAdapterMemory;
	use satchel_types::document::Revision;
	use serde_json::json;

	fn sync(hub: &ChannelHub, tab_id: &str) -> CrossTabSync {
		CrossTabSync::new(
			tab_id,
			Some(hub.channel("satchel:sync")),
			None,
			SyncConfig::default(),
		)
	}

	fn insert_event(id: &str) -> ChangeEvent {
		ChangeEvent::Insert {
			collection: "tasks".into(),
			document: Document {
				id: id.into(),
				rev: Revision::first("aaa"),
				updated_at: Timestamp(1000),
				deleted: false,
				vclock: None,
				data: serde_json::Map::new(),
			},
			sequence: 1,
			timestamp: Timestamp(1000),
			is_from_sync: false,
		}
	}

	async fn recv_event(
		rx: &mut tokio::sync::broadcast::Receiver<ChangeEvent>,
	) -> Option<ChangeEvent> {
		tokio::time::timeout(Duration::from_millis(500), rx.recv()).await.ok()?.ok()
	}

	#[tokio::test]
	async fn changes_reach_peers_tagged_as_synced() {
		let hub = ChannelHub::new();
		let a = sync(&hub, "tab-a");
		let b = sync(&hub, "tab-b");
		let mut events = b.subscribe_events();

		a.broadcast_change(&insert_event("d1")).unwrap();

		let event = recv_event(&mut events).await.expect("event expected");
		assert_eq!(event.document_id(), "d1");
		assert!(event.is_from_sync());
	}

	#[tokio::test]
	async fn own_changes_are_not_replayed_locally() {
		let hub = ChannelHub::new();
		let a = sync(&hub, "tab-a");
		let mut events = a.subscribe_events();

		a.broadcast_change(&insert_event("d1")).unwrap();

		assert!(recv_event(&mut events).await.is_none());
	}

	#[tokio::test]
	async fn replicated_events_are_not_rebroadcast() {
		let hub = ChannelHub::new();
		let a = sync(&hub, "tab-a");
		let b = sync(&hub, "tab-b");
		let mut events = b.subscribe_events();

		let replicated = insert_event("d1").into_synced();
		a.broadcast_change(&replicated).unwrap();

		assert!(recv_event(&mut events).await.is_none());
	}

	#[tokio::test]
	async fn redelivered_message_ids_are_dropped() {
		let hub = ChannelHub::new();
		let raw = hub.channel("satchel:sync");
		let b = sync(&hub, "tab-b");
		let mut events = b.subscribe_events();

		let envelope = json!({
			"type": "change",
			"messageId": "msg-1",
			"tabId": "tab-peer",
			"event": serde_json::to_value(insert_event("d1")).unwrap(),
		});

		raw.send(&envelope).unwrap();
		raw.send(&envelope).unwrap();

		assert!(recv_event(&mut events).await.is_some());
		// The second delivery produced no observable change.
		assert!(recv_event(&mut events).await.is_none());
	}

	#[tokio::test]
	async fn dedup_window_slides_and_expires() {
		let hub = ChannelHub::new();
		let config = SyncConfig {
			deduplication_window: Duration::from_millis(50),
			channel_prefix: "satchel".into(),
		};
		let b = CrossTabSync::new("tab-b", Some(hub.channel("satchel:sync")), None, config);
		let raw = hub.channel("satchel:sync");
		let mut events = b.subscribe_events();

		let envelope = json!({
			"type": "change",
			"messageId": "msg-1",
			"tabId": "tab-peer",
			"event": serde_json::to_value(insert_event("d1")).unwrap(),
		});

		raw.send(&envelope).unwrap();
		assert!(recv_event(&mut events).await.is_some());

		// Outside the window the id is forgotten and accepted again.
		tokio::time::sleep(Duration::from_millis(80)).await;
		raw.send(&envelope).unwrap();
		assert!(recv_event(&mut events).await.is_some());
	}

	#[tokio::test]
	async fn sync_request_is_answered_from_the_store() {
		let hub = ChannelHub::new();
		let store = Arc::new(StoreAdapterMemory::new());
		store.put("tasks", json!({"_id": "d1", "title": "x"})).await.unwrap();
		store.put("tasks", json!({"_id": "d2", "title": "y"})).await.unwrap();

		let _a = CrossTabSync::new(
			"tab-a",
			Some(hub.channel("satchel:sync")),
			Some(store),
			SyncConfig::default(),
		);
		let b = sync(&hub, "tab-b");
		let mut snapshots = b.subscribe_snapshots();

		b.request_sync("tasks", 0);

		let (collection, documents) =
			tokio::time::timeout(Duration::from_millis(500), snapshots.recv())
				.await
				.expect("timed out")
				.expect("snapshot expected");
		assert_eq!(collection.as_ref(), "tasks");
		assert_eq!(documents.len(), 2);
	}

	#[tokio::test]
	async fn sync_request_with_up_to_date_sequence_is_ignored() {
		let hub = ChannelHub::new();
		let store = Arc::new(StoreAdapterMemory::new());
		store.put("tasks", json!({"_id": "d1"})).await.unwrap();

		let _a = CrossTabSync::new(
			"tab-a",
			Some(hub.channel("satchel:sync")),
			Some(store),
			SyncConfig::default(),
		);
		let b = sync(&hub, "tab-b");
		let mut snapshots = b.subscribe_snapshots();

		b.request_sync("tasks", 1);

		assert!(tokio::time::timeout(Duration::from_millis(200), snapshots.recv())
			.await
			.is_err());
	}

	#[tokio::test]
	async fn without_channel_broadcast_is_a_noop() {
		let solo = CrossTabSync::new("tab-solo", None, None, SyncConfig::default());
		assert!(solo.broadcast_change(&insert_event("d1")).is_ok());
	}
}

// vim: ts=4
