use serde_json::Value;

/// Canonically encode a JSON value for hashing or signing.
///
/// `serde_json::Map` is backed by a `BTreeMap` (sorted by key) as long as
/// the `preserve_order` feature is not enabled anywhere in the dependency
/// graph — which holds for this workspace — so a plain compact
/// serialization is already "JSON objects sorted by key, no insignificant
/// whitespace". Callers must not enable `preserve_order` on `serde_json`.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("serde_json::Value serialization is infallible")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let v = json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
        let encoded = canonical_json(&v);
        let s = String::from_utf8(encoded).unwrap();
        assert_eq!(s, r#"{"a":2,"b":1,"c":{"y":2,"z":1}}"#);
    }

    #[test]
    fn stable_across_construction_order() {
        let v1 = json!({"x": 1, "y": 2});
        let v2 = json!({"y": 2, "x": 1});
        assert_eq!(canonical_json(&v1), canonical_json(&v2));
    }
}
