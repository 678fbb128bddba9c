//! Materialized views: persistent, incrementally maintained query results.
//!
//! A view keeps the full matched set sorted (the backing), and exposes the
//! limited window as its results. Incremental changes use binary-search
//! insertion; the per-change delta is computed by diffing the window before
//! and after, which makes the limit-eviction rules fall out naturally: a
//! document popped straight back off the tail was never in the window and
//! produces no delta, while a popped previous member is reported as
//! removed.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use satchel_types::change::ChangeEvent;
use satchel_types::document::Document;
use satchel_types::filter::Filter;
use satchel_types::prelude::*;
use satchel_types::query::{compare_docs, Projection, QuerySpec, SortField};

/// Rolling window of update-duration samples.
const UPDATE_TIME_SAMPLES: usize = 100;

/// Broadcast capacity for full-result emissions.
const RESULTS_CHANNEL_CAPACITY: usize = 64;

/// What a view computes: source collection, filter, sort, limit,
/// projection.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDefinition {
	pub collection: Box<str>,
	pub filter: Option<Filter>,
	pub sort: Option<Vec<SortField>>,
	pub limit: Option<u32>,
	pub projection: Option<Projection>,
}

impl ViewDefinition {
	pub fn new(collection: impl Into<Box<str>>) -> Self {
		Self { collection: collection.into(), ..Self::default() }
	}

	pub fn with_filter(mut self, filter: impl Into<Filter>) -> Self {
		self.filter = Some(filter.into());
		self
	}

	pub fn with_sort(mut self, sort: Vec<SortField>) -> Self {
		self.sort = Some(sort);
		self
	}

	pub fn with_limit(mut self, limit: u32) -> Self {
		self.limit = Some(limit);
		self
	}

	pub fn with_projection(mut self, projection: Projection) -> Self {
		self.projection = Some(projection);
		self
	}

	/// Matching/ordering spec; projection is applied only on emission.
	fn match_spec(&self) -> QuerySpec {
		QuerySpec {
			filter: self.filter.clone(),
			sort: self.sort.clone(),
			limit: None,
			skip: None,
			projection: None,
		}
	}
}

/// Before/after pair for an in-place modification.
#[derive(Debug, Clone, PartialEq)]
pub struct ModifiedDoc {
	pub before: Document,
	pub after: Document,
}

/// Window changes produced by one applied change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewDelta {
	pub added: Vec<Document>,
	pub removed: Vec<Document>,
	pub modified: Vec<ModifiedDoc>,
}

impl ViewDelta {
	pub fn is_empty(&self) -> bool {
		self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
	}
}

/// View observability snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewStats {
	pub result_count: usize,
	pub last_sequence: u64,
	pub created_at: Timestamp,
	pub updated_at: Timestamp,
	/// Rolling mean over the last 100 update durations, in milliseconds.
	pub avg_update_ms: f64,
}

/// A named, sorted, limited, projected result set maintained incrementally.
pub struct MaterializedView {
	name: Box<str>,
	definition: ViewDefinition,
	spec: QuerySpec,
	/// Every matching document, sorted. The window is its prefix.
	backing: Vec<Document>,
	/// Ids of the current window; always equals the id set of `results()`.
	result_ids: HashSet<Box<str>>,
	last_sequence: u64,
	created_at: Timestamp,
	updated_at: Timestamp,
	update_times: VecDeque<f64>,
	results_tx: Option<tokio::sync::broadcast::Sender<Vec<Document>>>,
}

impl MaterializedView {
	pub fn new(name: impl Into<Box<str>>, definition: ViewDefinition) -> Self {
		let spec = definition.match_spec();
		let (results_tx, _) = tokio::sync::broadcast::channel(RESULTS_CHANNEL_CAPACITY);
		let now = Timestamp::now();
		Self {
			name: name.into(),
			definition,
			spec,
			backing: Vec::new(),
			result_ids: HashSet::new(),
			last_sequence: 0,
			created_at: now,
			updated_at: now,
			update_times: VecDeque::new(),
			results_tx: Some(results_tx),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn definition(&self) -> &ViewDefinition {
		&self.definition
	}

	pub fn collection(&self) -> &str {
		&self.definition.collection
	}

	pub(crate) fn window(&self) -> &[Document] {
		let end = self
			.definition
			.limit
			.map(|l| (l as usize).min(self.backing.len()))
			.unwrap_or(self.backing.len());
		&self.backing[..end]
	}

	fn project(&self, docs: &[Document]) -> Vec<Document> {
		match &self.definition.projection {
			Some(projection) => docs.iter().map(|d| projection.apply(d)).collect(),
			None => docs.to_vec(),
		}
	}

	/// Current (projected) results.
	pub fn results(&self) -> Vec<Document> {
		self.project(self.window())
	}

	pub fn result_ids(&self) -> &HashSet<Box<str>> {
		&self.result_ids
	}

	/// Subscribe to full-result emissions; one arrives after every applied
	/// change with a non-empty delta.
	pub fn subscribe(&self) -> Option<tokio::sync::broadcast::Receiver<Vec<Document>>> {
		self.results_tx.as_ref().map(tokio::sync::broadcast::Sender::subscribe)
	}

	/// Complete the view's result stream. Further changes are still
	/// applied, but nothing is emitted.
	pub fn close(&mut self) {
		self.results_tx = None;
	}

	pub fn stats(&self) -> ViewStats {
		let avg_update_ms = if self.update_times.is_empty() {
			0.0
		} else {
			self.update_times.iter().sum::<f64>() / self.update_times.len() as f64
		};
		ViewStats {
			result_count: self.window().len(),
			last_sequence: self.last_sequence,
			created_at: self.created_at,
			updated_at: self.updated_at,
			avg_update_ms,
		}
	}

	/// Apply one change event incrementally. Returns the window delta, or
	/// `None` when the window is unaffected.
	pub fn apply_change(&mut self, event: &ChangeEvent) -> Option<ViewDelta> {
		let started = Instant::now();
		let old_window = self.window().to_vec();

		match event {
			ChangeEvent::Insert { document, .. } | ChangeEvent::Update { document, .. } => {
				self.remove_from_backing(&document.id);
				if self.spec.matches(document) {
					self.insert_into_backing(document.clone());
				}
			}
			ChangeEvent::Delete { document_id, .. } => {
				self.remove_from_backing(document_id);
			}
		}
		self.last_sequence = self.last_sequence.max(event.sequence());

		self.finish_update(&old_window, started)
	}

	/// Recompute the view wholesale from a fresh document set. Used by the
	/// view manager's change fan-out and for seeding a new view.
	pub fn refresh(&mut self, docs: Vec<Document>) -> Option<ViewDelta> {
		let started = Instant::now();
		let old_window = self.window().to_vec();

		self.backing = docs.into_iter().filter(|d| self.spec.matches(d)).collect();
		self.backing.sort_by(|a, b| compare_docs(a, b, self.spec.sort_fields()));

		self.finish_update(&old_window, started)
	}

	fn remove_from_backing(&mut self, id: &str) {
		self.backing.retain(|d| d.id.as_ref() != id);
	}

	fn insert_into_backing(&mut self, doc: Document) {
		let sort = self.spec.sort_fields();
		let index = self
			.backing
			.partition_point(|existing| compare_docs(existing, &doc, sort) == Ordering::Less);
		self.backing.insert(index, doc);
	}

	/// Diff the window, refresh bookkeeping, and emit on a non-empty delta.
	fn finish_update(&mut self, old_window: &[Document], started: Instant) -> Option<ViewDelta> {
		let new_window = self.window().to_vec();
		self.result_ids = new_window.iter().map(|d| d.id.clone()).collect();
		self.updated_at = Timestamp::now();

		self.update_times.push_back(started.elapsed().as_secs_f64() * 1000.0);
		if self.update_times.len() > UPDATE_TIME_SAMPLES {
			self.update_times.pop_front();
		}

		let delta = diff_windows(old_window, &new_window);
		if delta.is_empty() {
			return None;
		}

		let delta = ViewDelta {
			added: self.project(&delta.added),
			removed: self.project(&delta.removed),
			modified: delta
				.modified
				.into_iter()
				.map(|m| ModifiedDoc {
					before: self.project(&[m.before]).remove(0),
					after: self.project(&[m.after]).remove(0),
				})
				.collect(),
		};

		if let Some(tx) = &self.results_tx {
			// No subscribers is fine.
			let _ = tx.send(self.project(&new_window));
		}
		Some(delta)
	}
}

fn diff_windows(old: &[Document], new: &[Document]) -> ViewDelta {
	let old_ids: HashSet<&str> = old.iter().map(|d| d.id.as_ref()).collect();
	let new_ids: HashSet<&str> = new.iter().map(|d| d.id.as_ref()).collect();

	let added = new.iter().filter(|d| !old_ids.contains(d.id.as_ref())).cloned().collect();
	let removed = old.iter().filter(|d| !new_ids.contains(d.id.as_ref())).cloned().collect();
	let modified = new
		.iter()
		.filter_map(|after| {
			let before = old.iter().find(|b| b.id == after.id)?;
			(before != after).then(|| ModifiedDoc { before: before.clone(), after: after.clone() })
		})
		.collect();

	ViewDelta { added, removed, modified }
}

#[cfg(test)]
mod tests {
	use super::*;
	use satchel_types::document::Revision;
	use serde_json::{json, Value};

	fn doc(id: &str, data: Value) -> Document {
		let Value::Object(data) = data else { unreachable!() };
		Document {
			id: id.into(),
			rev: Revision::first("aaa"),
			updated_at: Timestamp(1000),
			deleted: false,
			vclock: None,
			data,
		}
	}

	fn insert_event(d: &Document, sequence: u64) -> ChangeEvent {
		ChangeEvent::Insert {
			collection: "tasks".into(),
			document: d.clone(),
			sequence,
			timestamp: Timestamp(sequence),
			is_from_sync: false,
		}
	}

	fn update_event(d: &Document, previous: &Document, sequence: u64) -> ChangeEvent {
		ChangeEvent::Update {
			collection: "tasks".into(),
			document: d.clone(),
			previous: Some(previous.clone()),
			sequence,
			timestamp: Timestamp(sequence),
			is_from_sync: false,
		}
	}

	fn delete_event(id: &str, sequence: u64) -> ChangeEvent {
		ChangeEvent::Delete {
			collection: "tasks".into(),
			document_id: id.into(),
			previous: None,
			sequence,
			timestamp: Timestamp(sequence),
			is_from_sync: false,
		}
	}

	fn active_view(limit: u32) -> MaterializedView {
		MaterializedView::new(
			"recent",
			ViewDefinition::new("tasks")
				.with_filter(json!({"active": true}))
				.with_sort(vec![SortField::asc("createdAt")])
				.with_limit(limit),
		)
	}

	fn ids(docs: &[Document]) -> Vec<&str> {
		docs.iter().map(|d| d.id.as_ref()).collect()
	}

	fn assert_invariants(view: &MaterializedView) {
		let results = view.results();
		// resultIds mirrors the window.
		let window_ids: HashSet<Box<str>> = results.iter().map(|d| d.id.clone()).collect();
		assert_eq!(&window_ids, view.result_ids());
		// Window is sorted under the view comparator.
		for pair in view.window().windows(2) {
			assert_ne!(
				compare_docs(&pair[0], &pair[1], view.spec.sort_fields()),
				Ordering::Greater
			);
		}
		// Window honors the limit.
		if let Some(limit) = view.definition.limit {
			assert!(results.len() <= limit as usize);
		}
	}

	#[test]
	fn inserts_maintain_sorted_window() {
		let mut view = active_view(10);

		for (id, at) in [("a", 3), ("b", 1), ("c", 2)] {
			let d = doc(id, json!({"active": true, "createdAt": at}));
			view.apply_change(&insert_event(&d, at as u64));
			assert_invariants(&view);
		}

		assert_eq!(ids(&view.results()), vec!["b", "c", "a"]);
	}

	#[test]
	fn insert_beyond_full_window_produces_no_delta() {
		let mut view = active_view(2);
		for (id, at) in [("a", 1), ("b", 2)] {
			let d = doc(id, json!({"active": true, "createdAt": at}));
			view.apply_change(&insert_event(&d, at as u64));
		}

		let late = doc("z", json!({"active": true, "createdAt": 9}));
		let delta = view.apply_change(&insert_event(&late, 3));
		assert!(delta.is_none());
		assert_eq!(ids(&view.results()), vec!["a", "b"]);
		assert_invariants(&view);
	}

	#[test]
	fn insert_evicting_previous_member_reports_removal() {
		let mut view = active_view(2);
		for (id, at) in [("a", 1), ("b", 2)] {
			let d = doc(id, json!({"active": true, "createdAt": at}));
			view.apply_change(&insert_event(&d, at as u64));
		}

		let early = doc("z", json!({"active": true, "createdAt": 0}));
		let delta = view.apply_change(&insert_event(&early, 3)).expect("delta expected");

		assert_eq!(ids(&delta.added), vec!["z"]);
		assert_eq!(ids(&delta.removed), vec!["b"]);
		assert_eq!(ids(&view.results()), vec!["z", "a"]);
		assert_invariants(&view);
	}

	#[test]
	fn departure_pulls_successor_into_window() {
		// Five active docs, limit 3; deactivating #2 pulls #4 in.
		let mut view = active_view(3);
		let docs: Vec<Document> = (1..=5)
			.map(|i| doc(&format!("d{}", i), json!({"active": true, "createdAt": i})))
			.collect();
		for (i, d) in docs.iter().enumerate() {
			view.apply_change(&insert_event(d, i as u64 + 1));
		}
		assert_eq!(ids(&view.results()), vec!["d1", "d2", "d3"]);

		let deactivated = doc("d2", json!({"active": false, "createdAt": 2}));
		let delta = view
			.apply_change(&update_event(&deactivated, &docs[1], 6))
			.expect("delta expected");

		assert_eq!(ids(&delta.removed), vec!["d2"]);
		assert_eq!(ids(&delta.added), vec!["d4"]);
		assert!(delta.modified.is_empty());
		assert_eq!(view.result_ids().len(), 3);
		assert_eq!(ids(&view.results()), vec!["d1", "d3", "d4"]);
		assert_invariants(&view);
	}

	#[test]
	fn in_place_update_reports_modified() {
		let mut view = active_view(10);
		let before = doc("a", json!({"active": true, "createdAt": 1, "note": "x"}));
		view.apply_change(&insert_event(&before, 1));

		let after = doc("a", json!({"active": true, "createdAt": 1, "note": "y"}));
		let delta = view.apply_change(&update_event(&after, &before, 2)).expect("delta");

		assert!(delta.added.is_empty());
		assert!(delta.removed.is_empty());
		assert_eq!(delta.modified.len(), 1);
		assert_eq!(delta.modified[0].before.data.get("note"), Some(&json!("x")));
		assert_eq!(delta.modified[0].after.data.get("note"), Some(&json!("y")));
	}

	#[test]
	fn delete_refills_from_backing() {
		let mut view = active_view(2);
		for (id, at) in [("a", 1), ("b", 2), ("c", 3)] {
			let d = doc(id, json!({"active": true, "createdAt": at}));
			view.apply_change(&insert_event(&d, at as u64));
		}
		assert_eq!(ids(&view.results()), vec!["a", "b"]);

		let delta = view.apply_change(&delete_event("a", 4)).expect("delta");
		assert_eq!(ids(&delta.removed), vec!["a"]);
		assert_eq!(ids(&delta.added), vec!["c"]);
		assert_eq!(ids(&view.results()), vec!["b", "c"]);
		assert_invariants(&view);
	}

	#[test]
	fn projection_applies_to_results_and_deltas() {
		let mut view = MaterializedView::new(
			"titles",
			ViewDefinition::new("tasks")
				.with_sort(vec![SortField::asc("createdAt")])
				.with_projection(
					Projection::from_value(&json!({"title": 1})).expect("projection"),
				),
		);

		let d = doc("a", json!({"title": "hello", "body": "long", "createdAt": 1}));
		let delta = view.apply_change(&insert_event(&d, 1)).expect("delta");

		assert_eq!(delta.added[0].data.get("title"), Some(&json!("hello")));
		assert!(delta.added[0].data.get("body").is_none());
		assert!(view.results()[0].data.get("body").is_none());
	}

	#[test]
	fn refresh_diffs_against_previous_window() {
		let mut view = active_view(10);
		view.refresh(vec![
			doc("a", json!({"active": true, "createdAt": 1})),
			doc("b", json!({"active": true, "createdAt": 2})),
		]);

		let delta = view
			.refresh(vec![
				doc("b", json!({"active": true, "createdAt": 2})),
				doc("c", json!({"active": true, "createdAt": 3})),
			])
			.expect("delta");

		assert_eq!(ids(&delta.added), vec!["c"]);
		assert_eq!(ids(&delta.removed), vec!["a"]);
		assert_invariants(&view);
	}

	#[test]
	fn tombstones_never_enter_the_window() {
		let mut view = active_view(10);
		let mut tomb = doc("a", json!({"active": true, "createdAt": 1}));
		tomb.deleted = true;

		assert!(view.apply_change(&insert_event(&tomb, 1)).is_none());
		assert!(view.results().is_empty());
	}

	#[tokio::test]
	async fn subscribers_receive_full_results() {
		let mut view = active_view(10);
		let mut rx = view.subscribe().expect("open stream");

		let d = doc("a", json!({"active": true, "createdAt": 1}));
		view.apply_change(&insert_event(&d, 1));

		let emitted = rx.recv().await.expect("emission");
		assert_eq!(ids(&emitted), vec!["a"]);

		view.close();
		let d2 = doc("b", json!({"active": true, "createdAt": 2}));
		view.apply_change(&insert_event(&d2, 2));
		assert!(rx.recv().await.is_err());
	}

	#[test]
	fn stats_track_sequence_and_samples() {
		let mut view = active_view(10);
		let d = doc("a", json!({"active": true, "createdAt": 1}));
		view.apply_change(&insert_event(&d, 41));

		let stats = view.stats();
		assert_eq!(stats.result_count, 1);
		assert_eq!(stats.last_sequence, 41);
		assert!(stats.avg_update_ms >= 0.0);
	}
}

// vim: ts=4
