//! # Ripple Diff
//!
//! Structural diffs between two JSON query results.
//!
//! A live query delivers its first result in full and every later result as
//! a delta against the previously delivered value. [`diff`] computes that
//! delta and returns `None` when the two values are equal, which is the
//! signal to suppress the outbound update entirely.
//!
//! ## Wire encoding
//!
//! The delta format distinguishes replacements from object deltas:
//!
//! - A changed leaf (or any shape mismatch) is encoded as a one-element
//!   array wrapping the new value: `[new]`.
//! - Two objects produce an object holding one entry per changed key. A key
//!   that disappeared maps to the empty array `[]`; added or changed keys
//!   map to their own delta. Unchanged keys are omitted.
//! - Arrays are compared whole; any difference replaces the array.
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//!
//! let previous = json!({"name": "alice", "count": 1});
//! let current = json!({"name": "alice", "count": 2});
//!
//! let delta = ripple_diff::diff(Some(&previous), &current);
//! assert_eq!(delta, Some(json!({"count": [2]})));
//!
//! // Equal values produce no delta at all.
//! assert_eq!(ripple_diff::diff(Some(&current), &current), None);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

use serde_json::{Map, Value};

/// Compute the structural delta between `previous` and `current`.
///
/// Returns `None` when the values are equal. With no previous value the
/// delta is a full replacement of `current`.
pub fn diff(previous: Option<&Value>, current: &Value) -> Option<Value> {
    let previous = match previous {
        Some(previous) => previous,
        None => return Some(replacement(current)),
    };

    if previous == current {
        return None;
    }

    match (previous, current) {
        (Value::Object(previous), Value::Object(current)) => object_delta(previous, current),
        _ => Some(replacement(current)),
    }
}

/// Encode `current` as a replacement delta.
///
/// Replacements wrap the value in a one-element array so clients can tell
/// them apart from per-key object deltas.
pub fn replacement(current: &Value) -> Value {
    Value::Array(vec![current.clone()])
}

/// Marker for a key that existed in the previous value but not the current.
pub fn deletion() -> Value {
    Value::Array(Vec::new())
}

fn object_delta(previous: &Map<String, Value>, current: &Map<String, Value>) -> Option<Value> {
    let mut delta = Map::new();

    for (key, previous_value) in previous {
        match current.get(key) {
            None => {
                delta.insert(key.clone(), deletion());
            }
            Some(current_value) => {
                if let Some(child) = diff(Some(previous_value), current_value) {
                    delta.insert(key.clone(), child);
                }
            }
        }
    }

    for (key, current_value) in current {
        if !previous.contains_key(key) {
            delta.insert(key.clone(), replacement(current_value));
        }
    }

    if delta.is_empty() {
        None
    } else {
        Some(Value::Object(delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equal_values_produce_no_delta() {
        let value = json!({"x": 1, "y": [1, 2, 3]});
        assert_eq!(diff(Some(&value), &value), None);
    }

    #[test]
    fn test_missing_previous_is_full_replacement() {
        let value = json!({"x": 1});
        assert_eq!(diff(None, &value), Some(json!([{"x": 1}])));
    }

    #[test]
    fn test_missing_previous_wraps_null_too() {
        // Even a null first value must produce a delta so the initial
        // delivery carries something decodable.
        assert_eq!(diff(None, &Value::Null), Some(json!([null])));
    }

    #[test]
    fn test_changed_scalar_is_replacement() {
        assert_eq!(diff(Some(&json!(1)), &json!(2)), Some(json!([2])));
        assert_eq!(diff(Some(&json!("a")), &json!(null)), Some(json!([null])));
    }

    #[test]
    fn test_changed_key_appears_in_object_delta() {
        let previous = json!({"x": 1, "y": 2});
        let current = json!({"x": 1, "y": 3});
        assert_eq!(diff(Some(&previous), &current), Some(json!({"y": [3]})));
    }

    #[test]
    fn test_added_key_is_replacement_entry() {
        let previous = json!({"x": 1});
        let current = json!({"x": 1, "y": 2});
        assert_eq!(diff(Some(&previous), &current), Some(json!({"y": [2]})));
    }

    #[test]
    fn test_removed_key_maps_to_deletion_marker() {
        let previous = json!({"x": 1, "y": 2});
        let current = json!({"x": 1});
        assert_eq!(diff(Some(&previous), &current), Some(json!({"y": []})));
    }

    #[test]
    fn test_nested_objects_diff_recursively() {
        let previous = json!({"user": {"name": "alice", "age": 30}, "version": 1});
        let current = json!({"user": {"name": "alice", "age": 31}, "version": 1});
        assert_eq!(
            diff(Some(&previous), &current),
            Some(json!({"user": {"age": [31]}}))
        );
    }

    #[test]
    fn test_shape_mismatch_is_replacement() {
        let previous = json!({"x": 1});
        let current = json!([1, 2]);
        assert_eq!(diff(Some(&previous), &current), Some(json!([[1, 2]])));
    }

    #[test]
    fn test_arrays_are_compared_whole() {
        let previous = json!({"items": [1, 2, 3]});
        let current = json!({"items": [1, 2, 4]});
        assert_eq!(
            diff(Some(&previous), &current),
            Some(json!({"items": [[1, 2, 4]]}))
        );
    }

    #[test]
    fn test_deleting_to_empty_array_differs_from_deletion_marker() {
        let previous = json!({"items": [1]});
        let current = json!({"items": []});
        // Replacement of a now-empty array wraps it: [[]], not the bare []
        // deletion marker.
        assert_eq!(
            diff(Some(&previous), &current),
            Some(json!({"items": [[]]}))
        );
    }
}
