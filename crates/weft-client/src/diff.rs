use serde_json::Value;

use weft_types::StateMap;

/// Non-symmetric "what's new" diff between two state snapshots, keyed
/// by the prior state's top-level keys:
///
/// - arrays keep only elements absent (by deep equality) from the old
///   array;
/// - objects recurse with the same rule;
/// - scalars carry the new value verbatim, changed or not.
///
/// This is a display diff, not a reversible patch.
pub fn state_diff(initial: &StateMap, current: &StateMap) -> StateMap {
    let mut diff = StateMap::new();
    for (key, old_value) in initial {
        let Some(new_value) = current.get(key) else {
            continue;
        };
        diff.insert(key.clone(), diff_value(old_value, new_value));
    }
    diff
}

fn diff_value(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Array(old_items), Value::Array(new_items)) => Value::Array(
            new_items
                .iter()
                .filter(|item| !old_items.contains(item))
                .cloned()
                .collect(),
        ),
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut nested = serde_json::Map::new();
            for (key, old_entry) in old_map {
                if let Some(new_entry) = new_map.get(key) {
                    nested.insert(key.clone(), diff_value(old_entry, new_entry));
                }
            }
            Value::Object(nested)
        }
        (_, new_value) => new_value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> StateMap {
        value.as_object().expect("object").clone()
    }

    #[test]
    fn identical_states_report_no_array_or_object_differences() {
        let snapshot = state(json!({
            "messages": [{"id": "u1", "content": "hi"}],
            "plan": {"steps": ["a", "b"]},
            "depth": "advanced"
        }));
        let diff = state_diff(&snapshot, &snapshot);
        assert_eq!(diff["messages"], json!([]));
        assert_eq!(diff["plan"], json!({"steps": []}));
        // scalars come through verbatim even when unchanged
        assert_eq!(diff["depth"], json!("advanced"));
    }

    #[test]
    fn array_diff_contains_only_new_elements() {
        let old = state(json!({"messages": [{"id": "u1"}]}));
        let new = state(json!({"messages": [{"id": "u1"}, {"id": "a1"}]}));
        let diff = state_diff(&old, &new);
        assert_eq!(diff["messages"], json!([{"id": "a1"}]));
    }

    #[test]
    fn object_diff_recurses_with_the_array_rule() {
        let old = state(json!({"plan": {"steps": ["a"], "note": "x"}}));
        let new = state(json!({"plan": {"steps": ["a", "b"], "note": "y"}}));
        let diff = state_diff(&old, &new);
        assert_eq!(diff["plan"]["steps"], json!(["b"]));
        assert_eq!(diff["plan"]["note"], json!("y"));
    }

    #[test]
    fn keys_missing_from_the_new_state_are_skipped() {
        let old = state(json!({"gone": 1, "kept": 2}));
        let new = state(json!({"kept": 3}));
        let diff = state_diff(&old, &new);
        assert!(diff.get("gone").is_none());
        assert_eq!(diff["kept"], json!(3));
    }
}
