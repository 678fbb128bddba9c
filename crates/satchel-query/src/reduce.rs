//! EventReduce: compile a change event into an O(1) action on an existing
//! query result set, with a re-execution signal for the cases a maintained
//! window cannot decide locally.
//!
//! The guiding invariant: applying the emitted action to the current
//! results always yields exactly what re-running the full query against the
//! post-change store would. Whenever a limited window could be grown by a
//! document the window has never seen (deletes and departures from a full
//! window, moves onto the tail of a full window), the reducer signals
//! `ReExecute` instead of guessing; the cost of a false positive is bounded
//! by the query's own cost.

use satchel_types::change::ChangeEvent;
use satchel_types::document::Document;
use satchel_types::query::{compare_docs, QuerySpec, SortField};
use std::cmp::Ordering;

/// Minimal mutation against an existing result set.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
	NoChange,
	InsertAt { index: usize, document: Document },
	RemoveAt { index: usize },
	UpdateAt { index: usize, document: Document },
	/// `to` is the insertion position in the array AFTER removing the
	/// element at `from`.
	Move { from: usize, to: usize, document: Document },
	/// The caller must re-run the full query.
	ReExecute,
}

/// Binary-search insertion position for `doc` under the sort comparator.
pub fn insertion_index(results: &[Document], doc: &Document, sort: &[SortField]) -> usize {
	results.partition_point(|existing| compare_docs(existing, doc, sort) == Ordering::Less)
}

/// Insertion position ignoring the element at `exclude`, i.e. against the
/// array with that element already removed.
fn insertion_index_excluding(
	results: &[Document],
	doc: &Document,
	sort: &[SortField],
	exclude: usize,
) -> usize {
	let mut index = 0;
	for (i, existing) in results.iter().enumerate() {
		if i == exclude {
			continue;
		}
		if compare_docs(existing, doc, sort) == Ordering::Less {
			index += 1;
		}
	}
	index
}

/// Whether the window can still be missing qualifying documents: a full
/// limited window may have successors outside it.
fn window_full(results: &[Document], spec: &QuerySpec) -> bool {
	spec.limit.is_some_and(|limit| results.len() >= limit as usize)
}

/// Compile a change event into an action on `results`.
///
/// `results` must be the unprojected maintained window of `spec`.
pub fn reduce(event: &ChangeEvent, results: &[Document], spec: &QuerySpec) -> Action {
	// A skip offset makes nearly every change ambiguous from inside the
	// window: anything entering, leaving or reordering the skipped prefix
	// shifts the window. Fall back to re-execution for relevant events.
	if spec.skip.unwrap_or(0) > 0 {
		let relevant = event.document().map(|d| spec.matches(d)).unwrap_or(false)
			|| event.previous().map(|d| spec.matches(d)).unwrap_or(false)
			|| results.iter().any(|d| d.id.as_ref() == event.document_id());
		return if relevant { Action::ReExecute } else { Action::NoChange };
	}

	let sort = spec.sort_fields();

	match event {
		ChangeEvent::Insert { document, .. } | ChangeEvent::Update { document, .. } => {
			let existing = results.iter().position(|d| d.id == document.id);
			let matches_now = spec.matches(document);

			match (existing, matches_now) {
				(None, false) => Action::NoChange,
				(None, true) => {
					let index = insertion_index(results, document, sort);
					if spec.limit.is_some_and(|limit| index >= limit as usize) {
						// Sorts past the end of a full window: never enters.
						return Action::NoChange;
					}
					Action::InsertAt { index, document: document.clone() }
				}
				(Some(index), false) => {
					if window_full(results, spec) {
						// A successor from outside the window may now qualify.
						Action::ReExecute
					} else {
						Action::RemoveAt { index }
					}
				}
				(Some(index), true) => {
					if compare_docs(&results[index], document, sort) == Ordering::Equal {
						return Action::UpdateAt { index, document: document.clone() };
					}
					let to = insertion_index_excluding(results, document, sort, index);
					if to == index {
						return Action::UpdateAt { index, document: document.clone() };
					}
					if window_full(results, spec) && to == results.len() - 1 && to > index {
						// Moved onto the tail of a full window: an unseen
						// successor may sort before it.
						return Action::ReExecute;
					}
					Action::Move { from: index, to, document: document.clone() }
				}
			}
		}
		ChangeEvent::Delete { document_id, .. } => {
			match results.iter().position(|d| d.id.as_ref() == document_id.as_ref()) {
				None => Action::NoChange,
				Some(index) => {
					if window_full(results, spec) {
						Action::ReExecute
					} else {
						Action::RemoveAt { index }
					}
				}
			}
		}
	}
}

/// Apply an action, producing a fresh result vector. `NoChange` and
/// `ReExecute` return the input unchanged; re-execution is the caller's
/// responsibility.
pub fn apply_action(mut results: Vec<Document>, action: Action, spec: &QuerySpec) -> Vec<Document> {
	match action {
		Action::NoChange | Action::ReExecute => results,
		Action::InsertAt { index, document } => {
			results.insert(index.min(results.len()), document);
			if let Some(limit) = spec.limit {
				results.truncate(limit as usize);
			}
			results
		}
		Action::RemoveAt { index } => {
			if index < results.len() {
				results.remove(index);
			}
			results
		}
		Action::UpdateAt { index, document } => {
			if index < results.len() {
				results[index] = document;
			}
			results
		}
		Action::Move { from, to, document } => {
			if from < results.len() {
				results.remove(from);
				results.insert(to.min(results.len()), document);
			}
			results
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use satchel_types::document::Revision;
	use satchel_types::query::{execute_spec, SortField};
	use satchel_types::types::Timestamp;
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

	fn insert_event(d: &Document) -> ChangeEvent {
		ChangeEvent::Insert {
			collection: "tasks".into(),
			document: d.clone(),
			sequence: 1,
			timestamp: Timestamp(1),
			is_from_sync: false,
		}
	}

	fn update_event(d: &Document, previous: Option<&Document>) -> ChangeEvent {
		ChangeEvent::Update {
			collection: "tasks".into(),
			document: d.clone(),
			previous: previous.cloned(),
			sequence: 1,
			timestamp: Timestamp(1),
			is_from_sync: false,
		}
	}

	fn delete_event(id: &str, previous: Option<&Document>) -> ChangeEvent {
		ChangeEvent::Delete {
			collection: "tasks".into(),
			document_id: id.into(),
			previous: previous.cloned(),
			sequence: 1,
			timestamp: Timestamp(1),
			is_from_sync: false,
		}
	}

	fn active_by_priority(limit: u32) -> QuerySpec {
		QuerySpec::new()
			.with_filter(json!({"status": "active"}))
			.with_sort(vec![SortField::asc("priority")])
			.with_limit(limit)
	}

	fn ids(results: &[Document]) -> Vec<&str> {
		results.iter().map(|d| d.id.as_ref()).collect()
	}

	#[test]
	fn insert_not_matching_is_no_change() {
		let spec = active_by_priority(2);
		let d = doc("x", json!({"status": "archived", "priority": 1}));
		assert_eq!(reduce(&insert_event(&d), &[], &spec), Action::NoChange);
	}

	#[test]
	fn scenario_inserts_into_limited_window() {
		// limit 2, sort by priority asc; insert A(2), B(1), C(3), all active.
		let spec = active_by_priority(2);
		let mut results = Vec::new();

		let a = doc("a", json!({"status": "active", "priority": 2}));
		let action = reduce(&insert_event(&a), &results, &spec);
		assert_eq!(action, Action::InsertAt { index: 0, document: a.clone() });
		results = apply_action(results, action, &spec);

		let b = doc("b", json!({"status": "active", "priority": 1}));
		let action = reduce(&insert_event(&b), &results, &spec);
		assert_eq!(action, Action::InsertAt { index: 0, document: b.clone() });
		results = apply_action(results, action, &spec);

		let c = doc("c", json!({"status": "active", "priority": 3}));
		let action = reduce(&insert_event(&c), &results, &spec);
		assert_eq!(action, Action::NoChange);
		results = apply_action(results, action, &spec);

		assert_eq!(ids(&results), vec!["b", "a"]);
	}

	#[test]
	fn insert_overflow_pops_tail() {
		// limit 2, window [b(1), c(3)]; insert a(2) -> [b, a], c evicted.
		let spec = active_by_priority(2);
		let results = vec![
			doc("b", json!({"status": "active", "priority": 1})),
			doc("c", json!({"status": "active", "priority": 3})),
		];

		let a = doc("a", json!({"status": "active", "priority": 2}));
		let action = reduce(&insert_event(&a), &results, &spec);
		assert_eq!(action, Action::InsertAt { index: 1, document: a.clone() });

		let results = apply_action(results, action, &spec);
		assert_eq!(ids(&results), vec!["b", "a"]);
	}

	#[test]
	fn update_entering_filter_behaves_like_insert() {
		let spec = active_by_priority(2);
		let results = vec![doc("a", json!({"status": "active", "priority": 2}))];

		let b_old = doc("b", json!({"status": "archived", "priority": 1}));
		let b_new = doc("b", json!({"status": "active", "priority": 1}));
		let action = reduce(&update_event(&b_new, Some(&b_old)), &results, &spec);
		assert_eq!(action, Action::InsertAt { index: 0, document: b_new });
	}

	#[test]
	fn update_leaving_filter_removes_when_window_not_full() {
		let spec = active_by_priority(5);
		let results = vec![
			doc("a", json!({"status": "active", "priority": 1})),
			doc("b", json!({"status": "active", "priority": 2})),
		];

		let b_gone = doc("b", json!({"status": "archived", "priority": 2}));
		let action = reduce(&update_event(&b_gone, Some(&results[1])), &results, &spec);
		assert_eq!(action, Action::RemoveAt { index: 1 });
	}

	#[test]
	fn update_leaving_full_window_reexecutes() {
		// Full window with a possible successor outside it.
		let spec = active_by_priority(2);
		let results = vec![
			doc("a", json!({"status": "active", "priority": 1})),
			doc("b", json!({"status": "active", "priority": 2})),
		];

		let b_gone = doc("b", json!({"status": "archived", "priority": 2}));
		let action = reduce(&update_event(&b_gone, Some(&results[1])), &results, &spec);
		assert_eq!(action, Action::ReExecute);
	}

	#[test]
	fn update_same_sort_key_updates_in_place() {
		let spec = active_by_priority(5);
		let results = vec![doc("a", json!({"status": "active", "priority": 1, "note": "x"}))];

		let a_new = doc("a", json!({"status": "active", "priority": 1, "note": "y"}));
		let action = reduce(&update_event(&a_new, Some(&results[0])), &results, &spec);
		assert_eq!(action, Action::UpdateAt { index: 0, document: a_new });
	}

	#[test]
	fn update_changed_sort_key_moves() {
		let spec = active_by_priority(5);
		let results = vec![
			doc("a", json!({"status": "active", "priority": 1})),
			doc("b", json!({"status": "active", "priority": 2})),
			doc("c", json!({"status": "active", "priority": 3})),
		];

		// c moves to the front.
		let c_new = doc("c", json!({"status": "active", "priority": 0}));
		let action = reduce(&update_event(&c_new, Some(&results[2])), &results, &spec);
		assert_eq!(action, Action::Move { from: 2, to: 0, document: c_new.clone() });

		let results = apply_action(results, action, &spec);
		assert_eq!(ids(&results), vec!["c", "a", "b"]);
	}

	#[test]
	fn move_to_index_is_relative_to_array_after_removal() {
		let spec = QuerySpec::new().with_sort(vec![SortField::asc("n")]);
		let results = vec![
			doc("a", json!({"n": 1})),
			doc("b", json!({"n": 2})),
			doc("c", json!({"n": 3})),
		];

		// a moves between b and c: in the array after removing index 0
		// ([b, c]) its insertion position is 1, not 2.
		let a_new = doc("a", json!({"n": 2.5}));
		let action = reduce(&update_event(&a_new, Some(&results[0])), &results, &spec);
		assert_eq!(action, Action::Move { from: 0, to: 1, document: a_new.clone() });

		let results = apply_action(results, action, &spec);
		assert_eq!(ids(&results), vec!["b", "a", "c"]);
	}

	#[test]
	fn move_onto_tail_of_full_window_reexecutes() {
		// limit 2, full window; b's key grows past a potential outsider.
		let spec = active_by_priority(2);
		let results = vec![
			doc("a", json!({"status": "active", "priority": 1})),
			doc("b", json!({"status": "active", "priority": 2})),
		];

		let a_new = doc("a", json!({"status": "active", "priority": 9}));
		let action = reduce(&update_event(&a_new, Some(&results[0])), &results, &spec);
		assert_eq!(action, Action::ReExecute);
	}

	#[test]
	fn delete_absent_is_no_change() {
		let spec = active_by_priority(2);
		let results = vec![doc("a", json!({"status": "active", "priority": 1}))];
		assert_eq!(reduce(&delete_event("zz", None), &results, &spec), Action::NoChange);
	}

	#[test]
	fn delete_from_full_limited_window_reexecutes() {
		let spec = active_by_priority(2);
		let results = vec![
			doc("a", json!({"status": "active", "priority": 1})),
			doc("b", json!({"status": "active", "priority": 2})),
		];
		assert_eq!(
			reduce(&delete_event("a", Some(&results[0])), &results, &spec),
			Action::ReExecute
		);
	}

	#[test]
	fn delete_without_limit_removes_in_place() {
		let spec = QuerySpec::new().with_sort(vec![SortField::asc("priority")]);
		let results = vec![doc("a", json!({"priority": 1})), doc("b", json!({"priority": 2}))];
		assert_eq!(
			reduce(&delete_event("b", Some(&results[1])), &results, &spec),
			Action::RemoveAt { index: 1 }
		);
	}

	#[test]
	fn replayed_insert_of_known_id_is_treated_as_update() {
		// Subscription replay can deliver an insert for a document the
		// snapshot already contained.
		let spec = active_by_priority(5);
		let results = vec![doc("a", json!({"status": "active", "priority": 1}))];

		let a_again = doc("a", json!({"status": "active", "priority": 1}));
		let action = reduce(&insert_event(&a_again), &results, &spec);
		assert_eq!(action, Action::UpdateAt { index: 0, document: a_again });
	}

	#[test]
	fn skip_offset_falls_back_to_reexecute() {
		let spec = QuerySpec::new()
			.with_sort(vec![SortField::asc("priority")])
			.with_skip(2)
			.with_limit(2);
		let results = vec![doc("c", json!({"priority": 3}))];

		let d = doc("d", json!({"priority": 0}));
		assert_eq!(reduce(&insert_event(&d), &results, &spec), Action::ReExecute);

		let unrelated = doc("x", json!({"priority": 1}));
		let mut tomb = unrelated.clone();
		tomb.deleted = true;
		// Irrelevant event (tombstone insert of an unknown id) stays no-change.
		assert_eq!(reduce(&insert_event(&tomb), &results, &spec), Action::NoChange);
	}

	/// Property: for a whole event sequence, reduce+apply (with fallback
	/// re-execution) equals running the full query on the final store.
	#[test]
	fn reduce_apply_equals_full_requery() {
		let spec = active_by_priority(3);

		// Simulated store plus maintained window.
		let mut store: Vec<Document> = Vec::new();
		let mut window: Vec<Document> = Vec::new();

		let steps: Vec<(&str, Document)> = vec![
			("put", doc("a", json!({"status": "active", "priority": 5}))),
			("put", doc("b", json!({"status": "active", "priority": 3}))),
			("put", doc("c", json!({"status": "archived", "priority": 1}))),
			("put", doc("d", json!({"status": "active", "priority": 4}))),
			("put", doc("e", json!({"status": "active", "priority": 1}))),
			("put", doc("b", json!({"status": "active", "priority": 9}))),
			("put", doc("c", json!({"status": "active", "priority": 2}))),
			("del", doc("e", json!({}))),
			("put", doc("a", json!({"status": "archived", "priority": 5}))),
			("del", doc("d", json!({}))),
		];

		for (op, d) in steps {
			let event = match op {
				"put" => {
					let previous = store.iter().find(|s| s.id == d.id).cloned();
					store.retain(|s| s.id != d.id);
					store.push(d.clone());
					match previous {
						Some(ref prev) => update_event(&d, Some(prev)),
						None => insert_event(&d),
					}
				}
				_ => {
					let previous = store.iter().find(|s| s.id == d.id).cloned();
					store.retain(|s| s.id != d.id);
					delete_event(&d.id, previous.as_ref())
				}
			};

			let action = reduce(&event, &window, &spec);
			window = if action == Action::ReExecute {
				execute_spec(store.clone(), &spec)
			} else {
				apply_action(window, action, &spec)
			};

			assert_eq!(
				ids(&window),
				ids(&execute_spec(store.clone(), &spec)),
				"window diverged after {} {}",
				op,
				d.id
			);
		}
	}
}

// vim: ts=4
