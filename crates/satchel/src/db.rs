//! Database builder: wires a store adapter, the coordination substrate,
//! and the engines together into one handle.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::prelude::*;
use satchel_query::{LiveQuery, LiveQueryConfig};
use satchel_tabs::{
	ChannelHub, CrossTabSync, ElectionConfig, LeaderElector, LockConfig, LockManager, SyncConfig,
	TabManager,
};
use satchel_types::channel::TabChannel;
use satchel_types::document::Document;
use satchel_types::query::{execute_spec, QuerySpec};
use satchel_types::store_adapter::{ChangeStream, StoreAdapter};
use satchel_types::utils::random_id;
use satchel_view::{ViewManager, ViewManagerConfig};

use futures::StreamExt;

/// Top-level configuration: one knob set per subsystem.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
	pub election: ElectionConfig,
	pub lock: LockConfig,
	pub sync: SyncConfig,
	pub view: ViewManagerConfig,
}

/// Builds a [`Database`] from a store adapter and an optional channel hub.
pub struct DatabaseBuilder {
	store: Option<Arc<dyn StoreAdapter>>,
	hub: Option<Arc<ChannelHub>>,
	config: DatabaseConfig,
}

impl Default for DatabaseBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl DatabaseBuilder {
	pub fn new() -> Self {
		Self { store: None, hub: None, config: DatabaseConfig::default() }
	}

	pub fn store(mut self, store: Arc<dyn StoreAdapter>) -> Self {
		self.store = Some(store);
		self
	}

	/// Share a hub between instances to get cross-tab behavior in one
	/// process. Without a hub the instance runs single-tab: it is its own
	/// leader and every lock acquire succeeds.
	pub fn hub(mut self, hub: Arc<ChannelHub>) -> Self {
		self.hub = Some(hub);
		self
	}

	pub fn channel_prefix(mut self, prefix: impl Into<Box<str>>) -> Self {
		self.config.sync.channel_prefix = prefix.into();
		self
	}

	pub fn election_config(mut self, config: ElectionConfig) -> Self {
		self.config.election = config;
		self
	}

	pub fn lock_config(mut self, config: LockConfig) -> Self {
		self.config.lock = config;
		self
	}

	pub fn sync_config(mut self, config: SyncConfig) -> Self {
		self.config.sync = config;
		self
	}

	pub fn view_config(mut self, config: ViewManagerConfig) -> Self {
		self.config.view = config;
		self
	}

	/// Assign the tab identity, start the election, and stand up locks,
	/// sync and views.
	pub async fn open(self) -> DbResult<Database> {
		let Some(store) = self.store else {
			return Err(Error::Internal("no store adapter configured".to_string()));
		};

		let tabs = Arc::new(TabManager::new());
		let prefix = self.config.sync.channel_prefix.clone();

		let leader_channel: Option<Arc<dyn TabChannel>> = self
			.hub
			.as_ref()
			.map(|hub| hub.channel(&format!("{}:leader", prefix)) as Arc<dyn TabChannel>);
		let lock_channel: Option<Arc<dyn TabChannel>> = self
			.hub
			.as_ref()
			.map(|hub| hub.channel(&format!("{}:lock", prefix)) as Arc<dyn TabChannel>);
		let sync_channel: Option<Arc<dyn TabChannel>> = self
			.hub
			.as_ref()
			.map(|hub| hub.channel(&self.config.sync.channel_name()) as Arc<dyn TabChannel>);

		let leader =
			Arc::new(LeaderElector::new(tabs.this_tab(), leader_channel, self.config.election));
		leader.start()?;

		let locks = Arc::new(LockManager::new(tabs.tab_id(), lock_channel, self.config.lock));
		let sync = Arc::new(CrossTabSync::new(
			tabs.tab_id(),
			sync_channel,
			Some(Arc::clone(&store)),
			self.config.sync,
		));
		let views = Arc::new(ViewManager::with_config(self.config.view));

		info!("database open (tab {})", tabs.tab_id());
		Ok(Database {
			store,
			tabs,
			leader,
			locks,
			sync,
			views,
			forwarders: Mutex::new(HashMap::new()),
		})
	}
}

/// One running database instance ("tab").
pub struct Database {
	store: Arc<dyn StoreAdapter>,
	tabs: Arc<TabManager>,
	leader: Arc<LeaderElector>,
	locks: Arc<LockManager>,
	sync: Arc<CrossTabSync>,
	views: Arc<ViewManager>,
	forwarders: Mutex<HashMap<Box<str>, JoinHandle<()>>>,
}

impl Database {
	pub fn builder() -> DatabaseBuilder {
		DatabaseBuilder::new()
	}

	pub fn collection(&self, name: impl Into<Box<str>>) -> Collection {
		Collection { store: Arc::clone(&self.store), name: name.into() }
	}

	pub fn store(&self) -> &Arc<dyn StoreAdapter> {
		&self.store
	}

	pub fn tabs(&self) -> &TabManager {
		&self.tabs
	}

	pub fn leader(&self) -> &LeaderElector {
		&self.leader
	}

	pub fn locks(&self) -> &LockManager {
		&self.locks
	}

	pub fn sync(&self) -> &CrossTabSync {
		&self.sync
	}

	pub fn views(&self) -> &ViewManager {
		&self.views
	}

	/// Forward a collection's local changes to peer tabs. Peer changes
	/// arrive through `sync().subscribe_events()`; applying them to the
	/// local store is the consumer's decision.
	pub async fn sync_collection(&self, name: &str) -> DbResult<()> {
		{
			let Ok(forwarders) = self.forwarders.lock() else {
				return Err(Error::Internal("forwarder registry poisoned".to_string()));
			};
			if forwarders.contains_key(name) {
				return Ok(());
			}
		}

		let mut changes = self.store.changes(name).await?;
		let sync = Arc::clone(&self.sync);
		let collection: Box<str> = name.into();
		let handle = tokio::spawn(async move {
			while let Some(event) = changes.next().await {
				if let Err(e) = sync.broadcast_change(&event) {
					warn!("failed to broadcast change for '{}': {}", collection, e);
				}
			}
		});

		if let Ok(mut forwarders) = self.forwarders.lock() {
			forwarders.insert(name.into(), handle);
		}
		Ok(())
	}

	/// Tear down elections, locks, sync and forwarders. Idempotent.
	pub fn close(&self) {
		self.leader.destroy();
		self.locks.destroy();
		self.sync.destroy();
		if let Ok(mut forwarders) = self.forwarders.lock() {
			for (_, handle) in forwarders.drain() {
				handle.abort();
			}
		}
	}
}

impl Drop for Database {
	fn drop(&mut self) {
		self.close();
	}
}

/// Typed handle on one collection.
pub struct Collection {
	store: Arc<dyn StoreAdapter>,
	name: Box<str>,
}

impl Collection {
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Insert a document, generating an `_id` when the input has none.
	pub async fn insert(&self, mut doc: Value) -> DbResult<Document> {
		if let Some(obj) = doc.as_object_mut() {
			obj.entry("_id").or_insert_with(|| Value::String(random_id()));
		}
		self.store.put(&self.name, doc).await
	}

	pub async fn put(&self, doc: Value) -> DbResult<Document> {
		self.store.put(&self.name, doc).await
	}

	pub async fn get(&self, id: &str) -> DbResult<Option<Document>> {
		self.store.get(&self.name, id).await
	}

	pub async fn get_all(&self) -> DbResult<Vec<Document>> {
		self.store.get_all(&self.name).await
	}

	pub async fn patch(&self, id: &str, patch: Value) -> DbResult<Document> {
		self.store.patch(&self.name, id, patch).await
	}

	pub async fn delete(&self, id: &str) -> DbResult<Option<Document>> {
		self.store.delete(&self.name, id).await
	}

	pub async fn compact(&self) -> DbResult<u64> {
		self.store.compact(&self.name).await
	}

	pub async fn count(&self) -> DbResult<u64> {
		self.store.count(&self.name).await
	}

	/// One-shot query.
	pub async fn find(&self, spec: &QuerySpec) -> DbResult<Vec<Document>> {
		let docs = self.store.get_all(&self.name).await?;
		Ok(execute_spec(docs, spec))
	}

	/// Reactive query over this collection; call `start()` on the result.
	pub fn live_query(&self, spec: QuerySpec, config: LiveQueryConfig) -> LiveQuery {
		LiveQuery::new(Arc::clone(&self.store), self.name.clone(), spec, config)
	}

	pub async fn changes(&self) -> DbResult<ChangeStream> {
		self.store.changes(&self.name).await
	}
}


// vim: ts=4
