//! Value kinds and the coercion rules applied to setting values.
//!
//! Writes coerce incoming JSON into the declared kind of a setting; typed
//! reads convert effective values into the caller's Rust type, trying a small
//! set of alternate representations before giving up.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Declared value type of a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Nullable or free-form value; accepts anything.
    Any,
    /// Boolean flag.
    Bool,
    /// Signed or unsigned integer.
    Integer,
    /// Floating point number.
    Float,
    /// Text value (also used for enum names).
    Text,
    /// JSON array.
    List,
    /// JSON object keyed by string.
    Map,
    /// Encrypted payload.
    Secure,
}

impl ValueKind {
    /// Infer the kind from a plain default value.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Any,
            Value::Bool(_) => Self::Bool,
            Value::Number(number) if number.is_f64() => Self::Float,
            Value::Number(_) => Self::Integer,
            Value::String(_) => Self::Text,
            Value::Array(_) => Self::List,
            Value::Object(_) => Self::Map,
        }
    }

    /// Coerce `value` into this kind, returning `None` when no lossless
    /// conversion exists.
    #[must_use]
    pub fn coerce(self, value: Value) -> Option<Value> {
        match (self, value) {
            (Self::Any, value) => Some(value),
            (Self::Secure, _) | (_, Value::Null) => None,
            (Self::Bool, Value::Bool(flag)) => Some(Value::Bool(flag)),
            (Self::Bool, Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "off" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            (Self::Bool, Value::Number(number)) => match number.as_i64() {
                Some(0) => Some(Value::Bool(false)),
                Some(1) => Some(Value::Bool(true)),
                _ => None,
            },
            (Self::Integer, Value::Number(number)) => integer_from_number(&number),
            (Self::Integer, Value::String(text)) => {
                let trimmed = text.trim();
                trimmed
                    .parse::<i64>()
                    .map(Value::from)
                    .or_else(|_| trimmed.parse::<u64>().map(Value::from))
                    .ok()
            }
            (Self::Float, Value::Number(number)) => {
                number.as_f64().and_then(Number::from_f64).map(Value::Number)
            }
            (Self::Float, Value::String(text)) => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            (Self::Text, Value::String(text)) => Some(Value::String(text)),
            (Self::Text, Value::Number(number)) => Some(Value::String(number.to_string())),
            (Self::Text, Value::Bool(flag)) => Some(Value::String(flag.to_string())),
            (Self::List, Value::Array(items)) => Some(Value::Array(items)),
            (Self::Map, Value::Object(map)) => Some(Value::Object(map)),
            _ => None,
        }
    }
}

fn integer_from_number(number: &Number) -> Option<Value> {
    if number.is_i64() || number.is_u64() {
        return Some(Value::Number(number.clone()));
    }
    let float = number.as_f64()?;
    #[allow(clippy::cast_possible_truncation)]
    let truncated = float as i64;
    #[allow(clippy::cast_precision_loss)]
    let exact = float.fract() == 0.0 && (truncated as f64 - float).abs() < f64::EPSILON;
    exact.then(|| Value::from(truncated))
}

/// Convert an effective value into `T`.
///
/// Tries the value as-is, then the JSON literal inside a string (`"42"` →
/// `42`), then the textual form of a scalar (`42` → `"42"`).
///
/// # Errors
///
/// Returns the error from the direct conversion when every alternative fails.
pub fn convert<T: DeserializeOwned>(value: &Value) -> Result<T, serde_json::Error> {
    let direct = match serde_json::from_value::<T>(value.clone()) {
        Ok(converted) => return Ok(converted),
        Err(err) => err,
    };
    let alternate = match value {
        Value::String(text) => serde_json::from_str::<Value>(text.trim()).ok(),
        Value::Number(number) => Some(Value::String(number.to_string())),
        Value::Bool(flag) => Some(Value::String(flag.to_string())),
        _ => None,
    };
    alternate
        .and_then(|candidate| serde_json::from_value::<T>(candidate).ok())
        .ok_or(direct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize, PartialEq)]
    enum Theme {
        Light,
        Dark,
    }

    #[test]
    fn kinds_are_inferred_from_defaults() {
        assert_eq!(ValueKind::of(&json!(50)), ValueKind::Integer);
        assert_eq!(ValueKind::of(&json!(0.5)), ValueKind::Float);
        assert_eq!(ValueKind::of(&json!(false)), ValueKind::Bool);
        assert_eq!(ValueKind::of(&json!("dark")), ValueKind::Text);
        assert_eq!(ValueKind::of(&json!([1, 2])), ValueKind::List);
        assert_eq!(ValueKind::of(&json!({"a": 1})), ValueKind::Map);
        assert_eq!(ValueKind::of(&Value::Null), ValueKind::Any);
    }

    #[test]
    fn coerce_accepts_textual_scalars() {
        assert_eq!(ValueKind::Integer.coerce(json!("85")), Some(json!(85)));
        assert_eq!(ValueKind::Integer.coerce(json!(85.0)), Some(json!(85)));
        assert_eq!(ValueKind::Integer.coerce(json!(85.5)), None);
        assert_eq!(ValueKind::Bool.coerce(json!("TRUE")), Some(json!(true)));
        assert_eq!(ValueKind::Bool.coerce(json!(0)), Some(json!(false)));
        assert_eq!(ValueKind::Float.coerce(json!("0.25")), Some(json!(0.25)));
        assert_eq!(ValueKind::Text.coerce(json!(12)), Some(json!("12")));
    }

    #[test]
    fn coerce_rejects_structural_mismatches() {
        assert_eq!(ValueKind::List.coerce(json!({"a": 1})), None);
        assert_eq!(ValueKind::Map.coerce(json!([1])), None);
        assert_eq!(ValueKind::Integer.coerce(Value::Null), None);
        assert_eq!(ValueKind::Secure.coerce(json!("x")), None);
        assert_eq!(ValueKind::Any.coerce(Value::Null), Some(Value::Null));
    }

    #[test]
    fn convert_tries_alternate_representations() {
        assert_eq!(convert::<i64>(&json!("42")).expect("string int"), 42);
        assert_eq!(convert::<String>(&json!(42)).expect("int string"), "42");
        assert!(convert::<bool>(&json!("true")).expect("string bool"));
        assert_eq!(convert::<Theme>(&json!("Dark")).expect("enum"), Theme::Dark);
        assert_eq!(convert::<Option<i64>>(&Value::Null).expect("null"), None);
        let map: HashMap<String, i64> = convert(&json!({"a": 1})).expect("map");
        assert_eq!(map.get("a"), Some(&1));
    }

    #[test]
    fn convert_reports_the_direct_error() {
        assert!(convert::<i64>(&json!("not a number")).is_err());
        assert!(convert::<Theme>(&json!("Purple")).is_err());
        assert!(convert::<Vec<i64>>(&json!({"a": 1})).is_err());
        assert_eq!(convert::<Theme>(&json!("Light")).expect("enum"), Theme::Light);
    }
}
