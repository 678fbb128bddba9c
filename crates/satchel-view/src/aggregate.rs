//! Aggregation over document sets: count/sum/avg/min/max on one field,
//! optionally grouped by one field.
//!
//! Sum, avg, min and max consider only numeric values; group keys are
//! stringified scalars, with null or missing keys bucketed under
//! `"_ungrouped"`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::HashMap;

use satchel_types::document::Document;
use satchel_types::error::{DbResult, Error};

/// Bucket for documents with a null or missing group key.
pub const UNGROUPED_KEY: &str = "_ungrouped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregateOp {
	Count,
	Sum,
	Avg,
	Min,
	Max,
}

/// One aggregation request. `field` is required for every op except count.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSpec {
	pub op: AggregateOp,
	pub field: Option<Box<str>>,
	pub group_by: Option<Box<str>>,
}

impl AggregateSpec {
	pub fn count() -> Self {
		Self { op: AggregateOp::Count, field: None, group_by: None }
	}

	pub fn new(op: AggregateOp, field: impl Into<Box<str>>) -> Self {
		Self { op, field: Some(field.into()), group_by: None }
	}

	pub fn grouped_by(mut self, group_by: impl Into<Box<str>>) -> Self {
		self.group_by = Some(group_by.into());
		self
	}
}

/// Scalar for ungrouped aggregations, `group → scalar` otherwise. A scalar
/// of `None` means no value existed to aggregate (e.g. min over no numbers).
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateResult {
	Scalar(Option<f64>),
	Grouped(HashMap<String, f64>),
}

/// Per-group accumulator.
#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
	count: u64,
	sum: f64,
	numeric_count: u64,
	min: Option<f64>,
	max: Option<f64>,
}

impl Accumulator {
	fn add(&mut self, numeric: Option<f64>) {
		self.count += 1;
		if let Some(n) = numeric {
			self.sum += n;
			self.numeric_count += 1;
			self.min = Some(self.min.map_or(n, |m| m.min(n)));
			self.max = Some(self.max.map_or(n, |m| m.max(n)));
		}
	}

	fn finish(&self, op: AggregateOp) -> Option<f64> {
		match op {
			AggregateOp::Count => Some(self.count as f64),
			AggregateOp::Sum => Some(self.sum),
			AggregateOp::Avg => {
				(self.numeric_count > 0).then(|| self.sum / self.numeric_count as f64)
			}
			AggregateOp::Min => self.min,
			AggregateOp::Max => self.max,
		}
	}
}

/// Stringify a group key value. Null, missing and structured values bucket
/// under [`UNGROUPED_KEY`].
fn group_key(doc: &Document, group_by: &str) -> String {
	match doc.field(group_by) {
		Some(Value::String(s)) => s,
		Some(Value::Number(n)) => n.to_string(),
		Some(Value::Bool(b)) => b.to_string(),
		_ => UNGROUPED_KEY.to_string(),
	}
}

/// Run an aggregation over a document set.
pub fn aggregate(docs: &[Document], spec: &AggregateSpec) -> DbResult<AggregateResult> {
	if spec.op != AggregateOp::Count && spec.field.is_none() {
		return Err(Error::ValidationError(format!(
			"aggregate op {:?} requires a field",
			spec.op
		)));
	}

	let numeric_of = |doc: &Document| -> Option<f64> {
		let field = spec.field.as_deref()?;
		doc.field(field).and_then(|v| v.as_f64())
	};

	match &spec.group_by {
		None => {
			let mut acc = Accumulator::default();
			for doc in docs {
				acc.add(numeric_of(doc));
			}
			Ok(AggregateResult::Scalar(acc.finish(spec.op)))
		}
		Some(group_by) => {
			let mut groups: HashMap<String, Accumulator> = HashMap::new();
			for doc in docs {
				let key = group_key(doc, group_by);
				groups.entry(key).or_default().add(numeric_of(doc));
			}

			let mut result = HashMap::new();
			for (key, acc) in groups {
				if let Some(value) = acc.finish(spec.op) {
					result.insert(key, value);
				}
			}
			Ok(AggregateResult::Grouped(result))
		}
	}
}


// vim: ts=4
