//! Flatten repaired output into one record list and renumber the ids.

use serde_json::Value;
use tracing::debug;

/// Identifier keys in priority order; only the first one present is rewritten.
pub const ID_KEYS: &[&str] = &["case_id", "用例编号"];

/// Coerce `value` into a flat list of records with positional ids.
///
/// A bare object becomes a one-element list, anything that is neither an
/// object nor an array yields an empty list. Nested arrays are expanded in
/// place and scalars are dropped. Record `i` (1-based) gets `TC_{i:03}`
/// under its identifier key; records without one are left untouched.
pub fn normalize(value: Value) -> Vec<Value> {
    let mut records = Vec::new();
    match value {
        Value::Array(_) | Value::Object(_) => flatten_into(value, &mut records),
        other => debug!("Nothing to normalize in non-container value: {}", other),
    }

    for (i, record) in records.iter_mut().enumerate() {
        let Value::Object(map) = record else {
            continue;
        };
        if let Some(key) = ID_KEYS.iter().find(|k| map.contains_key(**k)) {
            map.insert((*key).to_string(), Value::String(format_case_id(i + 1)));
        }
    }
    records
}

/// `TC_001`, `TC_042`, `TC_1234`.
pub fn format_case_id(n: usize) -> String {
    format!("TC_{:03}", n)
}

/// Append the records contained in `value` to `out`, walking arrays
/// positionally so the result order matches the input structure.
pub(crate) fn flatten_into(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        Value::Object(_) => out.push(value),
        scalar => debug!("Dropping non-record element: {}", scalar),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(records: &[Value], key: &str) -> Vec<String> {
        records
            .iter()
            .map(|r| r[key].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn nested_lists_are_flattened_in_order() {
        let input = json!([
            {"case_id": "x"},
            [{"case_id": "y"}, [{"case_id": "z"}]],
            "stray",
            3,
            {"case_id": "w"}
        ]);
        let out = normalize(input);
        assert_eq!(ids(&out, "case_id"), vec!["TC_001", "TC_002", "TC_003", "TC_004"]);
    }

    #[test]
    fn bare_object_becomes_singleton() {
        let out = normalize(json!({"case_id": "abc", "title": "t"}));
        assert_eq!(out, vec![json!({"case_id": "TC_001", "title": "t"})]);
    }

    #[test]
    fn scalars_yield_nothing() {
        assert!(normalize(json!("text")).is_empty());
        assert!(normalize(json!(null)).is_empty());
        assert!(normalize(json!(7)).is_empty());
    }

    #[test]
    fn localized_key_is_renumbered_in_place() {
        let out = normalize(json!([{"用例编号": "A-1", "用例名称": "登录"}]));
        assert_eq!(out[0]["用例编号"], "TC_001");
        assert!(out[0].get("case_id").is_none());
    }

    #[test]
    fn primary_key_wins_when_both_present() {
        let out = normalize(json!([{"case_id": "a", "用例编号": "b"}]));
        assert_eq!(out[0]["case_id"], "TC_001");
        assert_eq!(out[0]["用例编号"], "b");
    }

    #[test]
    fn records_without_id_keep_their_fields_but_count_positions() {
        let out = normalize(json!([{"title": "no id"}, {"case_id": "q"}]));
        assert_eq!(out[0], json!({"title": "no id"}));
        assert_eq!(out[1]["case_id"], "TC_002");
    }

    #[test]
    fn renumbering_is_idempotent() {
        let input = json!([{"case_id": "9"}, [{"case_id": "8"}], {"用例编号": "7"}]);
        let once = normalize(input);
        let twice = normalize(Value::Array(once.clone()));
        assert_eq!(once, twice);
    }

    #[test]
    fn ids_widen_past_three_digits() {
        let input = Value::Array((0..1000).map(|_| json!({"case_id": ""})).collect());
        let out = normalize(input);
        assert_eq!(out[998]["case_id"], "TC_999");
        assert_eq!(out[999]["case_id"], "TC_1000");
    }
}
