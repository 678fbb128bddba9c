//! Shallow merge semantics for partial document updates.
//!
//! - Top-level fields are merged (shallow)
//! - Nested objects are replaced entirely, not merged
//! - Dot notation keys (e.g., "profile.age") update nested fields
//! - `null` values delete the field

use serde_json::{Map, Value};

use crate::document::{parse_field_path, FORBIDDEN_KEYS};
use crate::error::{DbResult, Error};

/// Apply a patch object to a document payload.
///
/// Rules:
/// 1. Top-level fields from the patch are applied shallowly
/// 2. Nested objects are replaced entirely, not merged
/// 3. Dot notation keys update nested fields, creating intermediates
/// 4. `null` values delete the field
/// 5. Fields not in the patch remain unchanged
///
/// # Errors
/// Returns a `ValidationError` when a dot notation key traverses through a
/// non-object field, or when any key is in the forbidden set.
pub fn shallow_merge(target: &mut Map<String, Value>, patch: &Map<String, Value>) -> DbResult<()> {
	for (key, patch_value) in patch {
		if key.contains('.') {
			apply_dot_notation(target, key, patch_value)?;
		} else if FORBIDDEN_KEYS.contains(&key.as_str()) {
			return Err(Error::ValidationError(format!("forbidden key: {}", key)));
		} else {
			match patch_value {
				// null deletes the field
				Value::Null => {
					target.remove(key);
				}
				// everything else (including nested objects) overwrites entirely
				_ => {
					target.insert(key.clone(), patch_value.clone());
				}
			}
		}
	}
	Ok(())
}

/// Apply a dot notation key, creating intermediate objects as needed.
fn apply_dot_notation(
	target: &mut Map<String, Value>,
	dot_key: &str,
	value: &Value,
) -> DbResult<()> {
	let parts = parse_field_path(dot_key)?;

	let mut current = target;
	for &part in &parts[..parts.len() - 1] {
		let entry = current.entry(part.to_string()).or_insert_with(|| Value::Object(Map::new()));

		match entry.as_object_mut() {
			Some(obj) => current = obj,
			None => {
				return Err(Error::ValidationError(format!(
					"cannot apply dot notation '{}': field '{}' is not an object",
					dot_key, part
				)))
			}
		}
	}

	let final_key = parts[parts.len() - 1];
	match value {
		Value::Null => {
			current.remove(final_key);
		}
		_ => {
			current.insert(final_key.to_string(), value.clone());
		}
	}
	Ok(())
}


// vim: ts=4
