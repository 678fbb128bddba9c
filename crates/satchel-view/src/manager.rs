//! Named registry of materialized views with change fan-out and an
//! aggregation layer.
//!
//! The manager keeps the latest document image per collection (bounded by
//! `cache_size` when set) and recomputes the views of a collection from
//! those images whenever a change is routed through `handle_change`.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use tokio::sync::RwLock;

use satchel_types::change::ChangeOp;
use satchel_types::document::Document;
use satchel_types::prelude::*;

use crate::aggregate::{aggregate, AggregateResult, AggregateSpec};
use crate::view::{MaterializedView, ViewDefinition, ViewStats};

/// View manager knobs.
#[derive(Debug, Clone, Default)]
pub struct ViewManagerConfig {
	/// Maximum number of registered views.
	pub max_views: Option<usize>,
	/// Per-collection bound on cached document images.
	pub cache_size: Option<usize>,
}

type DocCache = LruCache<Box<str>, Document>;

/// Registry of named materialized views over cached document images.
pub struct ViewManager {
	config: ViewManagerConfig,
	views: RwLock<HashMap<Box<str>, MaterializedView>>,
	cache: RwLock<HashMap<Box<str>, DocCache>>,
}

impl Default for ViewManager {
	fn default() -> Self {
		Self::new()
	}
}

impl ViewManager {
	pub fn new() -> Self {
		Self::with_config(ViewManagerConfig::default())
	}

	pub fn with_config(config: ViewManagerConfig) -> Self {
		Self {
			config,
			views: RwLock::new(HashMap::new()),
			cache: RwLock::new(HashMap::new()),
		}
	}

	fn new_cache(&self) -> DocCache {
		match self.config.cache_size.and_then(NonZeroUsize::new) {
			Some(capacity) => LruCache::new(capacity),
			None => LruCache::unbounded(),
		}
	}

	/// Register a view under a unique name and seed it from the cached
	/// images of its collection.
	pub async fn create_view(&self, name: &str, definition: ViewDefinition) -> DbResult<()> {
		let mut views = self.views.write().await;

		if views.contains_key(name) {
			return Err(Error::ValidationError(format!("view already exists: {}", name)));
		}
		if let Some(max) = self.config.max_views {
			if views.len() >= max {
				return Err(Error::ValidationError(format!("view limit reached ({})", max)));
			}
		}

		let mut view = MaterializedView::new(name, definition);
		let docs = self.collection_snapshot(view.collection()).await;
		view.refresh(docs);

		debug!("created view '{}' over '{}'", name, view.collection());
		views.insert(name.into(), view);
		Ok(())
	}

	/// Remove a view, completing its result stream.
	pub async fn drop_view(&self, name: &str) -> DbResult<()> {
		let mut views = self.views.write().await;
		match views.remove(name) {
			Some(mut view) => {
				view.close();
				debug!("dropped view '{}'", name);
				Ok(())
			}
			None => Err(Error::NotFound(format!("view {}", name))),
		}
	}

	/// Route one document change into the cache and recompute every view of
	/// the collection.
	pub async fn handle_change(
		&self,
		collection: &str,
		doc_id: &str,
		op: ChangeOp,
		data: Option<Document>,
	) -> DbResult<()> {
		{
			let mut cache = self.cache.write().await;
			let images = cache.entry(collection.into()).or_insert_with(|| self.new_cache());
			match op {
				ChangeOp::Insert | ChangeOp::Update => {
					let doc = data.ok_or_else(|| {
						Error::ValidationError(format!(
							"{:?} change for '{}' is missing its document",
							op, doc_id
						))
					})?;
					images.put(doc_id.into(), doc);
				}
				ChangeOp::Delete => {
					images.pop(doc_id);
				}
			}
		}

		let docs = self.collection_snapshot(collection).await;
		let mut views = self.views.write().await;
		for view in views.values_mut().filter(|v| v.collection() == collection) {
			view.refresh(docs.clone());
		}
		Ok(())
	}

	async fn collection_snapshot(&self, collection: &str) -> Vec<Document> {
		let cache = self.cache.read().await;
		cache
			.get(collection)
			.map(|images| images.iter().map(|(_, doc)| doc.clone()).collect())
			.unwrap_or_default()
	}

	/// Current (projected) results of a view.
	pub async fn results(&self, name: &str) -> DbResult<Vec<Document>> {
		let views = self.views.read().await;
		views
			.get(name)
			.map(MaterializedView::results)
			.ok_or_else(|| Error::NotFound(format!("view {}", name)))
	}

	/// Aggregate over a view's current window (before projection, so op
	/// fields projected away from the output still aggregate).
	pub async fn aggregate(&self, name: &str, spec: &AggregateSpec) -> DbResult<AggregateResult> {
		let views = self.views.read().await;
		let view = views
			.get(name)
			.ok_or_else(|| Error::NotFound(format!("view {}", name)))?;
		aggregate(view.window(), spec)
	}

	pub async fn stats(&self, name: &str) -> DbResult<ViewStats> {
		let views = self.views.read().await;
		views
			.get(name)
			.map(MaterializedView::stats)
			.ok_or_else(|| Error::NotFound(format!("view {}", name)))
	}

	/// Subscribe to a view's full-result emissions.
	pub async fn subscribe(
		&self,
		name: &str,
	) -> DbResult<tokio::sync::broadcast::Receiver<Vec<Document>>> {
		let views = self.views.read().await;
		views
			.get(name)
			.and_then(MaterializedView::subscribe)
			.ok_or_else(|| Error::NotFound(format!("view {}", name)))
	}

	pub async fn list_views(&self) -> Vec<Box<str>> {
		let views = self.views.read().await;
		let mut names: Vec<Box<str>> = views.keys().cloned().collect();
		names.sort();
		names
	}

	pub async fn view_count(&self) -> usize {
		self.views.read().await.len()
	}
}


// vim: ts=4
