//! Utility functions: identifiers and payload hashing.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngExt;
use sha2::{Digest, Sha256};

pub const ID_LENGTH: usize = 16;
pub const SAFE: [char; 62] = [
	'0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
	'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
	'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
	'V', 'W', 'X', 'Y', 'Z',
];

/// Generate a random identifier from a URL-safe alphabet.
pub fn random_id() -> String {
	let mut rng = rand::rng();
	let mut result = String::with_capacity(ID_LENGTH);

	for _ in 0..ID_LENGTH {
		result.push(SAFE[rng.random_range(0..SAFE.len())]);
	}
	result
}

/// Number of base64url characters kept from the payload digest.
pub const HASH_LENGTH: usize = 12;

/// Hash a document payload for use in revision strings.
///
/// serde_json maps iterate in sorted key order, so serializing the payload
/// is canonical enough for hashing: equal payloads hash equally.
pub fn payload_hash(payload: &serde_json::Map<String, serde_json::Value>) -> String {
	let bytes = serde_json::to_vec(payload).unwrap_or_default();
	let digest = Sha256::digest(&bytes);
	let mut encoded = URL_SAFE_NO_PAD.encode(digest);
	encoded.truncate(HASH_LENGTH);
	encoded
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn random_id_has_expected_shape() {
		let id = random_id();
		assert_eq!(id.len(), ID_LENGTH);
		assert!(id.chars().all(|c| SAFE.contains(&c)));
	}

	#[test]
	fn random_ids_differ() {
		assert_ne!(random_id(), random_id());
	}

	#[test]
	fn payload_hash_is_stable() {
		let a = json!({"b": 2, "a": 1});
		let b = json!({"a": 1, "b": 2});
		let (Some(a), Some(b)) = (a.as_object(), b.as_object()) else {
			unreachable!()
		};
		assert_eq!(payload_hash(a), payload_hash(b));
		assert_eq!(payload_hash(a).len(), HASH_LENGTH);
	}

	#[test]
	fn payload_hash_changes_with_content() {
		let a = json!({"a": 1});
		let b = json!({"a": 2});
		let (Some(a), Some(b)) = (a.as_object(), b.as_object()) else {
			unreachable!()
		};
		assert_ne!(payload_hash(a), payload_hash(b));
	}
}

// vim: ts=4
