//! Lenient JSON-to-typed conversion for invoke results.
//!
//! Values crossing the wire come from peers in other runtimes, so a
//! numerically integral float where an integer is expected, a single
//! value where a one-element list is expected, or a string where bytes
//! are expected, are accepted rather than rejected. Conversion tries
//! the strict decode first and only then a small set of safe rewrites;
//! when none applies the strict error is returned.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{Result, RpcError};

pub fn from_value_lenient<T: DeserializeOwned>(what: &str, value: Value) -> Result<T> {
    let strict_err = match serde_json::from_value::<T>(value.clone()) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    let normalized = normalize_numbers(value);
    if let Ok(v) = serde_json::from_value::<T>(normalized.clone()) {
        return Ok(v);
    }
    // A scalar where a sequence is expected decodes as a one-element list.
    if !matches!(normalized, Value::Array(_)) {
        if let Ok(v) = serde_json::from_value::<T>(Value::Array(vec![normalized.clone()])) {
            return Ok(v);
        }
    }
    // A string where bytes are expected decodes as its UTF-8 bytes.
    if let Value::String(s) = &normalized {
        let bytes = Value::Array(s.bytes().map(Value::from).collect());
        if let Ok(v) = serde_json::from_value::<T>(bytes) {
            return Ok(v);
        }
    }

    Err(RpcError::Decode {
        what: what.to_owned(),
        source: strict_err,
    })
}

/// Rewrite integral floats as integers, recursively.
fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if n.as_i64().is_none() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    return Value::from(f as i64);
                }
            }
            Value::Number(n)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn integral_float_decodes_as_int() {
        let v: i64 = from_value_lenient("n", serde_json::json!(3.0)).unwrap();
        assert_eq!(v, 3);
    }

    #[test]
    fn fractional_float_stays_an_error_for_int() {
        assert!(from_value_lenient::<i64>("n", serde_json::json!(3.5)).is_err());
    }

    #[test]
    fn int_decodes_as_float() {
        let v: f64 = from_value_lenient("n", serde_json::json!(3)).unwrap();
        assert_eq!(v, 3.0);
    }

    #[test]
    fn scalar_wraps_into_one_element_vec() {
        let v: Vec<i64> = from_value_lenient("ns", serde_json::json!(7)).unwrap();
        assert_eq!(v, vec![7]);
    }

    #[test]
    fn nested_structs_normalize_numbers() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Inner {
            count: u32,
        }
        let v: Inner = from_value_lenient("inner", serde_json::json!({"count": 4.0})).unwrap();
        assert_eq!(v, Inner { count: 4 });
    }

    #[test]
    fn string_decodes_as_utf8_bytes() {
        let v: Vec<u8> = from_value_lenient("raw", serde_json::json!("ab")).unwrap();
        assert_eq!(v, b"ab");
        // A string wanted as a list of strings still wraps, not bytes.
        let v: Vec<String> = from_value_lenient("names", serde_json::json!("ab")).unwrap();
        assert_eq!(v, vec!["ab".to_owned()]);
    }

    #[test]
    fn plain_mismatch_reports_strict_error() {
        let err = from_value_lenient::<i64>("n", serde_json::json!("nope")).unwrap_err();
        assert!(matches!(err, RpcError::Decode { .. }));
    }
}
