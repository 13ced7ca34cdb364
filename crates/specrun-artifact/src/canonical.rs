//! Canonical JSON encoding
//!
//! Object keys are emitted in sorted order with compact separators and
//! non-ASCII text kept as UTF-8. Hashes are always computed over this form,
//! never over whatever a serializer happened to produce.

use serde_json::Value;

/// Render `value` canonically.
#[must_use]
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        // Numbers, booleans and null have a single compact rendering.
        other => out.push_str(&other.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json escapes only what JSON requires and leaves UTF-8 intact.
    out.push_str(&Value::String(s.to_owned()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_nested_keys() {
        let v = json!({"z": 1, "a": {"d": true, "c": null}});
        assert_eq!(to_canonical_string(&v), r#"{"a":{"c":null,"d":true},"z":1}"#);
    }

    #[test]
    fn keeps_array_order_and_utf8() {
        let v = json!({"list": ["b", "a"], "name": "Zürich"});
        assert_eq!(to_canonical_string(&v), r#"{"list":["b","a"],"name":"Zürich"}"#);
    }

    #[test]
    fn escapes_control_characters() {
        let v = json!({"text": "line\n\"quoted\""});
        assert_eq!(to_canonical_string(&v), r#"{"text":"line\n\"quoted\""}"#);
    }
}
