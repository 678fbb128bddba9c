//! Live queries: result sets continuously maintained under a change stream.
//!
//! The initial execution runs the query against the store; afterwards each
//! change event is funneled through EventReduce, with fallback to full
//! re-execution whenever the reducer signals `ReExecute`. State is published
//! through a `tokio::sync::watch` channel, so new subscribers always see the
//! current state without triggering a re-query, and destroying the query
//! completes every subscriber stream exactly once.

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use satchel_types::change::ChangeEvent;
use satchel_types::document::Document;
use satchel_types::prelude::*;
use satchel_types::query::{execute_spec, QuerySpec};
use satchel_types::store_adapter::{ChangeStream, StoreAdapter};

use crate::reduce::{apply_action, reduce, Action};

/// Flushing a debounce buffer larger than this prefers one full
/// re-execution over replaying the events one by one.
const DEBOUNCE_REPLAY_MAX: usize = 5;

/// Live query tuning knobs.
#[derive(Debug, Clone)]
pub struct LiveQueryConfig {
	/// Quiet period before buffered changes are applied. Zero applies each
	/// change immediately.
	pub debounce_ms: u64,
	/// When false, every change triggers a full re-execution.
	pub use_event_reduce: bool,
	/// Seed results published before the first execution.
	pub initial_data: Option<Vec<Document>>,
}

impl Default for LiveQueryConfig {
	fn default() -> Self {
		Self::new()
	}
}

impl LiveQueryConfig {
	pub fn new() -> Self {
		Self { debounce_ms: 0, use_event_reduce: true, initial_data: None }
	}
}

/// Observable state of a live query.
#[derive(Debug, Clone)]
pub struct LiveQueryState {
	pub data: Vec<Document>,
	pub is_loading: bool,
	pub error: Option<Box<str>>,
	pub last_updated: Timestamp,
}

impl LiveQueryState {
	fn initial(data: Vec<Document>) -> Self {
		Self { data, is_loading: false, error: None, last_updated: Timestamp::now() }
	}
}

struct Inner {
	store: Arc<dyn StoreAdapter>,
	collection: Box<str>,
	/// User-visible spec, including projection.
	spec: QuerySpec,
	/// Maintained window spec: projection stripped so sort fields survive.
	exec_spec: QuerySpec,
	config: LiveQueryConfig,
	/// Unprojected maintained window.
	results: tokio::sync::Mutex<Vec<Document>>,
	/// Serializes executions; `is_executing` elides redundant ones.
	exec_lock: tokio::sync::Mutex<()>,
	is_executing: AtomicBool,
	destroyed: AtomicBool,
	state_tx: std::sync::Mutex<Option<watch::Sender<LiveQueryState>>>,
	state_rx: watch::Receiver<LiveQueryState>,
}

impl Inner {
	fn set_state(&self, update: impl FnOnce(&mut LiveQueryState)) {
		if let Ok(guard) = self.state_tx.lock() {
			if let Some(tx) = guard.as_ref() {
				tx.send_modify(update);
			}
		}
	}

	fn project(&self, results: &[Document]) -> Vec<Document> {
		match &self.spec.projection {
			Some(projection) => results.iter().map(|d| projection.apply(d)).collect(),
			None => results.to_vec(),
		}
	}

	fn publish_results(&self, results: &[Document]) {
		let data = self.project(results);
		self.set_state(|state| {
			state.data = data;
			state.is_loading = false;
			state.error = None;
			state.last_updated = Timestamp::now();
		});
	}

	/// Run the full query. When `force` is false a concurrent execution
	/// elides this one; `refresh()` passes true and waits its turn instead.
	async fn execute(&self, force: bool) {
		if !force && self.is_executing.load(Ordering::Acquire) {
			debug!("execution already in flight for '{}', eliding", self.collection);
			return;
		}
		let _guard = self.exec_lock.lock().await;
		if self.destroyed.load(Ordering::Acquire) {
			return;
		}

		self.is_executing.store(true, Ordering::Release);
		self.set_state(|state| state.is_loading = true);

		match self.store.get_all(&self.collection).await {
			Ok(docs) => {
				let window = execute_spec(docs, &self.exec_spec);
				*self.results.lock().await = window.clone();
				self.publish_results(&window);
			}
			Err(e) => {
				// Executor failures surface as state, never as panics or
				// propagated errors; the last-good data is preserved.
				let error = Error::ExecutorError(e.to_string());
				warn!("live query on '{}' failed: {}", self.collection, error);
				self.set_state(|state| {
					state.is_loading = false;
					state.error = Some(error.to_string().into());
					state.last_updated = Timestamp::now();
				});
			}
		}

		self.is_executing.store(false, Ordering::Release);
	}

	/// Apply a flushed batch of change events to the maintained window.
	async fn apply_events(&self, events: Vec<ChangeEvent>) {
		if !self.config.use_event_reduce || events.len() > DEBOUNCE_REPLAY_MAX {
			self.execute(false).await;
			return;
		}

		let mut changed = false;
		{
			let mut results = self.results.lock().await;
			for event in &events {
				let action = reduce(event, &results, &self.exec_spec);
				match action {
					Action::ReExecute => {
						drop(results);
						self.execute(false).await;
						return;
					}
					Action::NoChange => {}
					action => {
						*results = apply_action(std::mem::take(&mut *results), action, &self.exec_spec);
						changed = true;
					}
				}
			}
			if changed {
				let snapshot = results.clone();
				drop(results);
				self.publish_results(&snapshot);
			}
		}
	}
}

/// A query whose result set is continuously maintained.
pub struct LiveQuery {
	inner: Arc<Inner>,
	pump: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LiveQuery {
	pub fn new(
		store: Arc<dyn StoreAdapter>,
		collection: impl Into<Box<str>>,
		spec: QuerySpec,
		config: LiveQueryConfig,
	) -> Self {
		let mut exec_spec = spec.clone();
		exec_spec.projection = None;

		let initial = config.initial_data.clone().unwrap_or_default();
		let (state_tx, state_rx) = watch::channel(LiveQueryState::initial(initial.clone()));

		let inner = Arc::new(Inner {
			store,
			collection: collection.into(),
			spec,
			exec_spec,
			config,
			results: tokio::sync::Mutex::new(initial),
			exec_lock: tokio::sync::Mutex::new(()),
			is_executing: AtomicBool::new(false),
			destroyed: AtomicBool::new(false),
			state_tx: std::sync::Mutex::new(Some(state_tx)),
			state_rx,
		});
		Self { inner, pump: std::sync::Mutex::new(None) }
	}

	/// Subscribe to the change stream, run the initial execution, and start
	/// maintaining results. Idempotent while running.
	pub async fn start(&self) -> DbResult<()> {
		if self.inner.destroyed.load(Ordering::Acquire) {
			return Err(Error::Internal("live query already destroyed".to_string()));
		}
		if self.pump.lock().map(|p| p.is_some()).unwrap_or(false) {
			return Ok(());
		}

		// Subscribe before the snapshot so no event can fall between them;
		// replayed overlap is absorbed by the reducer's upsert handling.
		let stream = self.inner.store.changes(&self.inner.collection).await?;

		if self.inner.config.initial_data.is_some() {
			let results = self.inner.results.lock().await.clone();
			self.inner.publish_results(&results);
		} else {
			self.inner.execute(true).await;
		}

		let handle = tokio::spawn(pump(Arc::clone(&self.inner), stream));
		if let Ok(mut pump) = self.pump.lock() {
			*pump = Some(handle);
		}
		Ok(())
	}

	/// Detach from the change stream without touching state.
	pub fn stop(&self) {
		if let Ok(mut pump) = self.pump.lock() {
			if let Some(handle) = pump.take() {
				handle.abort();
			}
		}
	}

	/// Stop and complete the state stream. Idempotent.
	pub fn destroy(&self) {
		if self.inner.destroyed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.stop();
		if let Ok(mut tx) = self.inner.state_tx.lock() {
			// Dropping the sender completes every subscriber stream.
			tx.take();
		}
	}

	/// Explicit full re-execution, waiting out any in-flight one.
	pub async fn refresh(&self) {
		self.inner.execute(true).await;
	}

	pub fn state(&self) -> LiveQueryState {
		self.inner.state_rx.borrow().clone()
	}

	/// Current (projected) results.
	pub fn data(&self) -> Vec<Document> {
		self.state().data
	}

	pub fn spec(&self) -> &QuerySpec {
		&self.inner.spec
	}

	/// Raw watch receiver; useful for waiting on state transitions.
	pub fn watch_state(&self) -> watch::Receiver<LiveQueryState> {
		self.inner.state_rx.clone()
	}

	/// Stream of states: current state first, then every change. Completes
	/// when the query is destroyed.
	pub fn subscribe_state(&self) -> impl futures::Stream<Item = LiveQueryState> + Send + use<> {
		let mut rx = self.inner.state_rx.clone();
		async_stream::stream! {
			let first = rx.borrow().clone();
			yield first;
			while rx.changed().await.is_ok() {
				let next = rx.borrow_and_update().clone();
				yield next;
			}
		}
	}

	/// Stream of result arrays, replaying the current one first.
	pub fn subscribe_data(&self) -> impl futures::Stream<Item = Vec<Document>> + Send + use<> {
		let mut rx = self.inner.state_rx.clone();
		async_stream::stream! {
			let first = rx.borrow().data.clone();
			yield first;
			while rx.changed().await.is_ok() {
				let next = rx.borrow_and_update().data.clone();
				yield next;
			}
		}
	}
}

impl Drop for LiveQuery {
	fn drop(&mut self) {
		self.destroy();
	}
}

/// Event pump: buffers stream events under the debounce window and applies
/// them. Ends when the stream closes or the query is destroyed.
async fn pump(inner: Arc<Inner>, mut stream: ChangeStream) {
	let debounce = Duration::from_millis(inner.config.debounce_ms);
	let mut buffer: Vec<ChangeEvent> = Vec::new();

	loop {
		if inner.destroyed.load(Ordering::Acquire) {
			break;
		}

		if debounce.is_zero() {
			match stream.next().await {
				Some(event) => inner.apply_events(vec![event]).await,
				None => break,
			}
			continue;
		}

		if buffer.is_empty() {
			match stream.next().await {
				Some(event) => buffer.push(event),
				None => break,
			}
			continue;
		}

		// The sleep restarts on every received event, so the buffer is
		// flushed after a quiet period of `debounce_ms`.
		tokio::select! {
			next = stream.next() => match next {
				Some(event) => buffer.push(event),
				None => {
					inner.apply_events(std::mem::take(&mut buffer)).await;
					break;
				}
			},
			() = tokio::time::sleep(debounce) => {
				inner.apply_events(std::mem::take(&mut buffer)).await;
			}
		}
	}
	debug!("live query pump for '{}' ended", inner.collection);
}


// vim: ts=4
