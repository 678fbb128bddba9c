//! Pure predicate engine over documents.
//!
//! A filter is a (possibly nested) operator tree in JSON shape:
//!
//! ```json
//! { "status": "active", "age": { "$gte": 18 }, "$or": [ ... ] }
//! ```
//!
//! Top-level clauses are ANDed. A bare non-operator value is an implicit
//! `$eq`; an empty or absent filter matches everything. Evaluation is
//! deterministic and side-effect-free, and it fails closed: unknown
//! operators, type-mismatched comparisons, and rejected regex patterns all
//! evaluate to no-match instead of erroring.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::document::Document;
use crate::error::{DbResult, Error};

/// Maximum accepted regex pattern length.
pub const MAX_REGEX_LENGTH: usize = 1000;

/// Declarative document predicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(Value);

impl Filter {
	pub fn new(spec: Value) -> Self {
		Self(spec)
	}

	/// Filter that matches every document.
	pub fn empty() -> Self {
		Self(Value::Object(serde_json::Map::new()))
	}

	pub fn is_empty(&self) -> bool {
		match &self.0 {
			Value::Null => true,
			Value::Object(obj) => obj.is_empty(),
			_ => false,
		}
	}

	pub fn as_value(&self) -> &Value {
		&self.0
	}

	/// Evaluate this filter against a document.
	pub fn matches(&self, doc: &Document) -> bool {
		match &self.0 {
			Value::Null => true,
			Value::Object(obj) => eval_clauses(doc, obj),
			// A filter spec must be an object; anything else fails closed
			// (except null, which means "no filter").
			_ => false,
		}
	}
}

impl From<Value> for Filter {
	fn from(spec: Value) -> Self {
		Self::new(spec)
	}
}

fn eval_clauses(doc: &Document, clauses: &serde_json::Map<String, Value>) -> bool {
	clauses.iter().all(|(key, operand)| eval_clause(doc, key, operand))
}

fn eval_clause(doc: &Document, key: &str, operand: &Value) -> bool {
	match key {
		"$and" => match operand.as_array() {
			Some(subs) => subs.iter().all(|sub| Filter::new(sub.clone()).matches(doc)),
			None => false,
		},
		"$or" => match operand.as_array() {
			Some(subs) => subs.iter().any(|sub| Filter::new(sub.clone()).matches(doc)),
			None => false,
		},
		"$nor" => match operand.as_array() {
			Some(subs) => !subs.iter().any(|sub| Filter::new(sub.clone()).matches(doc)),
			None => false,
		},
		"$not" => match operand.as_object() {
			Some(obj) => !eval_clauses(doc, obj),
			None => false,
		},
		_ if key.starts_with('$') => false,
		_ => {
			let value = doc.field(key);
			eval_condition(value.as_ref(), operand)
		}
	}
}

/// Evaluate a per-field condition: either an operator object or an
/// implicit `$eq` against a bare value.
fn eval_condition(value: Option<&Value>, condition: &Value) -> bool {
	if let Value::Object(ops) = condition {
		if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) {
			return ops.iter().all(|(op, operand)| eval_operator(value, op, operand));
		}
	}
	eval_eq(value, condition)
}

fn eval_operator(value: Option<&Value>, op: &str, operand: &Value) -> bool {
	match op {
		"$eq" => eval_eq(value, operand),
		"$ne" => !eval_eq(value, operand),
		"$gt" => compare_same_kind(value, operand) == Some(Ordering::Greater),
		"$gte" => matches!(
			compare_same_kind(value, operand),
			Some(Ordering::Greater | Ordering::Equal)
		),
		"$lt" => compare_same_kind(value, operand) == Some(Ordering::Less),
		"$lte" => {
			matches!(compare_same_kind(value, operand), Some(Ordering::Less | Ordering::Equal))
		}
		"$in" => match operand.as_array() {
			Some(allowed) => value.is_some_and(|v| allowed.contains(v)),
			None => false,
		},
		"$nin" => match operand.as_array() {
			Some(denied) => value.is_none_or(|v| !denied.contains(v)),
			None => false,
		},
		"$exists" => match operand.as_bool() {
			Some(expected) => value.is_some_and(|v| !v.is_null()) == expected,
			None => false,
		},
		"$regex" => eval_regex(value, operand),
		"$not" => !eval_condition(value, operand),
		// Unknown operator: fail closed.
		_ => false,
	}
}

/// Structural equality. `null` in the filter matches both an explicit null
/// and an absent field.
fn eval_eq(value: Option<&Value>, operand: &Value) -> bool {
	match value {
		Some(v) => v == operand,
		None => operand.is_null(),
	}
}

/// Strict comparison between same-kind comparable values (numbers and
/// strings). Mixed or non-comparable kinds fail closed.
fn compare_same_kind(value: Option<&Value>, operand: &Value) -> Option<Ordering> {
	match (value?, operand) {
		(Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
		(Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
		_ => None,
	}
}

fn eval_regex(value: Option<&Value>, operand: &Value) -> bool {
	let (Some(Value::String(haystack)), Value::String(pattern)) = (value, operand) else {
		return false;
	};
	match compile_safe_regex(pattern) {
		Ok(re) => re.is_match(haystack),
		Err(_) => false,
	}
}

/// Compile a regex pattern, rejecting ones that invite catastrophic
/// backtracking: overlong patterns and quantified groups that themselves
/// contain a quantifier (`(a+)+`, `(a*)*`, `(a{1,9}){2,}` and friends).
pub fn compile_safe_regex(pattern: &str) -> DbResult<Regex> {
	if pattern.len() > MAX_REGEX_LENGTH {
		return Err(Error::UnsafeRegex(format!(
			"pattern exceeds {} characters",
			MAX_REGEX_LENGTH
		)));
	}
	if has_nested_quantifier(pattern) {
		return Err(Error::UnsafeRegex("nested quantifier".to_string()));
	}
	Regex::new(pattern).map_err(|e| Error::UnsafeRegex(e.to_string()))
}

/// Detect a quantifier applied to a group whose body already contains one.
fn has_nested_quantifier(pattern: &str) -> bool {
	// Stack of "this group body contains a quantifier" flags; index 0 is
	// the top-level body.
	let mut stack = vec![false];
	let mut chars = pattern.chars().peekable();
	let mut in_class = false;
	let mut escaped = false;

	while let Some(c) = chars.next() {
		if escaped {
			escaped = false;
			continue;
		}
		match c {
			'\\' => escaped = true,
			'[' if !in_class => in_class = true,
			']' if in_class => in_class = false,
			_ if in_class => {}
			'(' => stack.push(false),
			')' => {
				let body_quantified = stack.pop().unwrap_or(false);
				let group_quantified = matches!(chars.peek(), Some('+' | '*' | '{'));
				if body_quantified && group_quantified {
					return true;
				}
				if let Some(parent) = stack.last_mut() {
					*parent |= body_quantified;
				}
			}
			'+' | '*' | '{' => {
				if let Some(top) = stack.last_mut() {
					*top = true;
				}
			}
			_ => {}
		}
	}
	false
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::document::Revision;
	use crate::types::Timestamp;
	use serde_json::json;

	fn doc(data: Value) -> Document {
		let Value::Object(data) = data else { unreachable!() };
		Document {
			id: "d1".into(),
			rev: Revision::first("aaa"),
			updated_at: Timestamp(1000),
			deleted: false,
			vclock: None,
			data,
		}
	}

	fn filter(spec: Value) -> Filter {
		Filter::new(spec)
	}

	#[test]
	fn empty_filter_matches_everything() {
		let d = doc(json!({"a": 1}));
		assert!(Filter::empty().matches(&d));
		assert!(filter(Value::Null).matches(&d));
	}

	#[test]
	fn bare_value_is_implicit_eq() {
		let d = doc(json!({"status": "active", "count": 3}));
		assert!(filter(json!({"status": "active"})).matches(&d));
		assert!(!filter(json!({"status": "archived"})).matches(&d));
		assert!(filter(json!({"count": 3})).matches(&d));
	}

	#[test]
	fn implicit_eq_is_structural() {
		let d = doc(json!({"tags": ["a", "b"], "meta": {"x": 1}}));
		assert!(filter(json!({"tags": ["a", "b"]})).matches(&d));
		assert!(!filter(json!({"tags": ["b", "a"]})).matches(&d));
		assert!(filter(json!({"meta": {"x": 1}})).matches(&d));
	}

	#[test]
	fn comparison_operators() {
		let d = doc(json!({"age": 21, "name": "bob"}));
		assert!(filter(json!({"age": {"$gt": 18}})).matches(&d));
		assert!(filter(json!({"age": {"$gte": 21}})).matches(&d));
		assert!(!filter(json!({"age": {"$lt": 21}})).matches(&d));
		assert!(filter(json!({"age": {"$lte": 21}})).matches(&d));
		assert!(filter(json!({"name": {"$gt": "alice"}})).matches(&d));
		assert!(filter(json!({"age": {"$ne": 22}})).matches(&d));
	}

	#[test]
	fn comparisons_fail_closed_on_mixed_kinds() {
		let d = doc(json!({"age": 21, "flag": true}));
		assert!(!filter(json!({"age": {"$gt": "18"}})).matches(&d));
		assert!(!filter(json!({"flag": {"$gt": false}})).matches(&d));
		assert!(!filter(json!({"missing": {"$lt": 5}})).matches(&d));
	}

	#[test]
	fn set_operators() {
		let d = doc(json!({"status": "active"}));
		assert!(filter(json!({"status": {"$in": ["active", "paused"]}})).matches(&d));
		assert!(!filter(json!({"status": {"$nin": ["active"]}})).matches(&d));
		assert!(filter(json!({"status": {"$nin": ["archived"]}})).matches(&d));
		// Missing field: $in fails, $nin matches.
		assert!(!filter(json!({"missing": {"$in": [1]}})).matches(&d));
		assert!(filter(json!({"missing": {"$nin": [1]}})).matches(&d));
		// Non-array operand fails closed for both.
		assert!(!filter(json!({"status": {"$in": "active"}})).matches(&d));
		assert!(!filter(json!({"status": {"$nin": "archived"}})).matches(&d));
	}

	#[test]
	fn exists_operator() {
		let d = doc(json!({"a": 1, "b": null}));
		assert!(filter(json!({"a": {"$exists": true}})).matches(&d));
		assert!(filter(json!({"b": {"$exists": false}})).matches(&d));
		assert!(filter(json!({"c": {"$exists": false}})).matches(&d));
		assert!(!filter(json!({"c": {"$exists": true}})).matches(&d));
	}

	#[test]
	fn regex_operator() {
		let d = doc(json!({"name": "satchel-db"}));
		assert!(filter(json!({"name": {"$regex": "^satchel"}})).matches(&d));
		assert!(!filter(json!({"name": {"$regex": "^db"}})).matches(&d));
		// Non-string value fails closed.
		let n = doc(json!({"name": 42}));
		assert!(!filter(json!({"name": {"$regex": "42"}})).matches(&n));
	}

	#[test]
	fn logical_operators() {
		let d = doc(json!({"a": 1, "b": 2}));
		assert!(filter(json!({"$and": [{"a": 1}, {"b": 2}]})).matches(&d));
		assert!(filter(json!({"$or": [{"a": 9}, {"b": 2}]})).matches(&d));
		assert!(!filter(json!({"$nor": [{"a": 1}]})).matches(&d));
		assert!(filter(json!({"$nor": [{"a": 9}, {"b": 9}]})).matches(&d));
		assert!(filter(json!({"$not": {"a": 9}})).matches(&d));
		assert!(!filter(json!({"$not": {"a": 1}})).matches(&d));
		assert!(filter(json!({"a": {"$not": {"$gt": 5}}})).matches(&d));
	}

	#[test]
	fn nested_dot_paths() {
		let d = doc(json!({"user": {"address": {"city": "Oslo"}}}));
		assert!(filter(json!({"user.address.city": "Oslo"})).matches(&d));
		assert!(!filter(json!({"user.address.city": "Bergen"})).matches(&d));
		assert!(!filter(json!({"user.phone.home": "n/a"})).matches(&d));
	}

	#[test]
	fn unknown_operator_fails_closed() {
		let d = doc(json!({"a": 1}));
		assert!(!filter(json!({"a": {"$near": 1}})).matches(&d));
		assert!(!filter(json!({"$xor": [{"a": 1}]})).matches(&d));
	}

	#[test]
	fn evaluation_is_deterministic() {
		let d = doc(json!({"a": 1, "b": [1, 2, 3]}));
		let f = filter(json!({"$or": [{"a": {"$gte": 1}}, {"b": {"$exists": true}}]}));
		let first = f.matches(&d);
		for _ in 0..10 {
			assert_eq!(f.matches(&d), first);
		}
	}

	#[test]
	fn safe_regex_accepts_normal_patterns() {
		assert!(compile_safe_regex("^[a-z]+[0-9]{2,4}$").is_ok());
		assert!(compile_safe_regex("foo|bar").is_ok());
		assert!(compile_safe_regex(r"\(a+\)+").is_ok()); // escaped parens
	}

	#[test]
	fn safe_regex_rejects_nested_quantifiers() {
		assert!(compile_safe_regex("(a+)+").is_err());
		assert!(compile_safe_regex("(a*)*").is_err());
		assert!(compile_safe_regex("(a{1,9}){2,}").is_err());
		assert!(compile_safe_regex("(ab(c+)d)+").is_err());
	}

	#[test]
	fn safe_regex_rejects_overlong_patterns() {
		let long = "a".repeat(MAX_REGEX_LENGTH + 1);
		assert!(compile_safe_regex(&long).is_err());
	}

	#[test]
	fn safe_regex_rejects_invalid_patterns() {
		assert!(compile_safe_regex("(unclosed").is_err());
	}

	#[test]
	fn invalid_pattern_fails_closed_in_filter() {
		let d = doc(json!({"name": "x"}));
		assert!(!filter(json!({"name": {"$regex": "(a+)+"}})).matches(&d));
		assert!(!filter(json!({"name": {"$regex": "(unclosed"}})).matches(&d));
	}
}

// vim: ts=4
