//! Declarative query specification consumed by all higher layers:
//! filter, sort, limit, skip, and projection.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::cmp::Ordering;

use crate::document::Document;
use crate::error::{DbResult, Error};
use crate::filter::Filter;

/// One sort key: field path plus direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
	pub field: Box<str>,
	pub ascending: bool,
}

impl SortField {
	pub fn asc(field: impl Into<Box<str>>) -> Self {
		Self { field: field.into(), ascending: true }
	}

	pub fn desc(field: impl Into<Box<str>>) -> Self {
		Self { field: field.into(), ascending: false }
	}
}

/// Field projection: inclusion (`{field: 1}`) or exclusion (`{field: 0}`).
/// Mixing the two forms is rejected. `_id` and the reserved metadata fields
/// always survive projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
	Include(Vec<Box<str>>),
	Exclude(Vec<Box<str>>),
}

impl Projection {
	/// Parse the `{field: 0|1}` map shape.
	pub fn from_value(value: &Value) -> DbResult<Self> {
		let obj = value
			.as_object()
			.ok_or_else(|| Error::ValidationError("projection must be an object".to_string()))?;

		let mut include = Vec::new();
		let mut exclude = Vec::new();
		for (field, flag) in obj {
			match flag.as_u64() {
				Some(1) => include.push(field.as_str().into()),
				Some(0) => exclude.push(field.as_str().into()),
				_ => {
					return Err(Error::ValidationError(format!(
						"projection value for '{}' must be 0 or 1",
						field
					)))
				}
			}
		}
		if !include.is_empty() && !exclude.is_empty() {
			return Err(Error::ValidationError(
				"projection cannot mix inclusion and exclusion".to_string(),
			));
		}
		if include.is_empty() && exclude.is_empty() {
			return Err(Error::ValidationError("projection must not be empty".to_string()));
		}
		if exclude.is_empty() {
			Ok(Projection::Include(include))
		} else {
			Ok(Projection::Exclude(exclude))
		}
	}

	/// Apply the projection, returning a document with a trimmed payload.
	pub fn apply(&self, doc: &Document) -> Document {
		let mut projected = doc.clone();
		match self {
			Projection::Include(fields) => {
				projected
					.data
					.retain(|key, _| fields.iter().any(|f| f.as_ref() == key.as_str()));
			}
			Projection::Exclude(fields) => {
				projected
					.data
					.retain(|key, _| !fields.iter().any(|f| f.as_ref() == key.as_str()));
			}
		}
		projected
	}
}

impl Serialize for Projection {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut map = serde_json::Map::new();
		let (fields, flag) = match self {
			Projection::Include(fields) => (fields, 1),
			Projection::Exclude(fields) => (fields, 0),
		};
		for field in fields {
			map.insert(field.to_string(), Value::Number(flag.into()));
		}
		Value::Object(map).serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for Projection {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let value = Value::deserialize(deserializer)?;
		Projection::from_value(&value).map_err(serde::de::Error::custom)
	}
}

/// Declarative query shape: `{filter, sort, limit, skip, projection}`.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
	pub filter: Option<Filter>,
	pub sort: Option<Vec<SortField>>,
	pub limit: Option<u32>,
	pub skip: Option<u32>,
	pub projection: Option<Projection>,
}

impl QuerySpec {
	pub fn new() -> Self {
		Self::default()
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

	pub fn with_skip(mut self, skip: u32) -> Self {
		self.skip = Some(skip);
		self
	}

	pub fn with_projection(mut self, projection: Projection) -> Self {
		self.projection = Some(projection);
		self
	}

	/// Whether a document belongs to this query's matched set. Tombstones
	/// never match.
	pub fn matches(&self, doc: &Document) -> bool {
		if doc.is_tombstone() {
			return false;
		}
		self.filter.as_ref().is_none_or(|f| f.matches(doc))
	}

	pub fn sort_fields(&self) -> &[SortField] {
		self.sort.as_deref().unwrap_or(&[])
	}
}

/// Compare two JSON values for sorting. Absent sorts before present;
/// mixed kinds fall back to their string rendering so the order is total.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
	match (a, b) {
		(None, None) => Ordering::Equal,
		(None, Some(_)) => Ordering::Less,
		(Some(_), None) => Ordering::Greater,
		(Some(Value::Number(a)), Some(Value::Number(b))) => {
			a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal)
		}
		(Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
		(Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
		(Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
	}
}

/// Compare two documents under a sort key, tiebreaking on `_id` so the
/// resulting order is total and deterministic.
pub fn compare_docs(a: &Document, b: &Document, sort: &[SortField]) -> Ordering {
	for field in sort {
		let a_val = a.field(&field.field);
		let b_val = b.field(&field.field);

		let ord = compare_values(a_val.as_ref(), b_val.as_ref());
		let ord = if field.ascending { ord } else { ord.reverse() };

		if ord != Ordering::Equal {
			return ord;
		}
	}
	a.id.cmp(&b.id)
}

/// Run a query spec against a full document set: filter, sort, skip,
/// limit, projection. This is the re-execution path shared by live queries
/// and materialized views.
pub fn execute_spec(docs: Vec<Document>, spec: &QuerySpec) -> Vec<Document> {
	let mut results: Vec<Document> = docs.into_iter().filter(|d| spec.matches(d)).collect();

	results.sort_by(|a, b| compare_docs(a, b, spec.sort_fields()));

	let start = spec.skip.unwrap_or(0) as usize;
	if start >= results.len() {
		return Vec::new();
	}
	let end = spec
		.limit
		.map(|l| (start + l as usize).min(results.len()))
		.unwrap_or(results.len());
	let mut window = results[start..end].to_vec();

	if let Some(ref projection) = spec.projection {
		window = window.iter().map(|d| projection.apply(d)).collect();
	}
	window
}


// vim: ts=4
