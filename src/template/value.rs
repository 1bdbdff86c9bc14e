//! Conversions between template values and text.
//!
//! Template values are plain [`serde_json::Value`]s. Objects and arrays print
//! as compact JSON so that values fetched from variables interpolate cleanly
//! into JSON documents.

use std::cmp::Ordering;

use serde_json::Value;

/// Text produced when `value` is printed by an action.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Go-style truthiness: empty values are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "slice",
        Value::Object(_) => "map",
    }
}

/// Interpret `value` as an integer, accepting numeric strings.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Equality used by `eq`/`ne`: numbers compare numerically, everything else structurally.
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering used by `lt`/`le`/`gt`/`ge`; only numbers and strings are ordered.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_text() {
        assert_eq!(to_text(&Value::Null), "");
        assert_eq!(to_text(&json!("deploy")), "deploy");
        assert_eq!(to_text(&json!(3)), "3");
        assert_eq!(to_text(&json!(["a", 1])), r#"["a",1]"#);
        assert_eq!(to_text(&json!({"a": {"b": true}})), r#"{"a":{"b":true}}"#);
    }

    #[test]
    fn test_truthy() {
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!({"k": 1})));
    }

    #[test]
    fn test_numbers_compare_across_representations() {
        assert!(loosely_equal(&json!(1), &json!(1.0)));
        assert_eq!(compare(&json!(2), &json!(10)), Some(Ordering::Less));
        assert_eq!(compare(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare(&json!("b"), &json!(1)), None);
    }
}
