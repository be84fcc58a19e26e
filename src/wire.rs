// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The closed scalar/list/map value type that crosses every worker and
//! control-surface boundary: command arguments, settings, and frame payload
//! fields. Serialized with `serde_json` underneath so the wire format stays
//! plain newline-delimited JSON (see `control.rs`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// `ManageProcess` always sends a command's args as a list of positional
    /// values (`ManageProcess("W", "print", ["hi"], 5)`); this reads the
    /// first one, falling back to treating the whole value as the argument
    /// for callers that pass it unwrapped (e.g. in-process tests).
    pub fn first_positional(&self) -> Option<&Value> {
        match self {
            Value::List(items) => items.first(),
            Value::Null => None,
            other => Some(other),
        }
    }

    /// Coerces a raw settings value the way the control-plane wire format
    /// describes it: a UTF-8 scalar is read as a bool for the literal
    /// `"True"`/`"False"`, as an int if it parses as one, as a float on the
    /// next attempt, and as opaque JSON otherwise. Non-string JSON values
    /// pass through unchanged.
    pub fn coerce_from_wire(raw: &JsonValue) -> Value {
        match raw {
            JsonValue::String(s) => {
                if s == "True" {
                    Value::Bool(true)
                } else if s == "False" {
                    Value::Bool(false)
                } else if let Ok(i) = s.parse::<i64>() {
                    Value::Int(i)
                } else if let Ok(f) = s.parse::<f64>() {
                    Value::Float(f)
                } else {
                    serde_json::from_str::<Value>(s).unwrap_or_else(|_| Value::Str(s.clone()))
                }
            }
            other => Value::from(other.clone()),
        }
    }
}

impl From<JsonValue> for Value {
    fn from(raw: JsonValue) -> Self {
        match raw {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => Value::Str(s),
            JsonValue::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for JsonValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(b),
            Value::Int(i) => JsonValue::Number(i.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Str(s) => JsonValue::String(s),
            Value::List(items) => JsonValue::Array(items.into_iter().map(JsonValue::from).collect()),
            Value::Map(map) => {
                JsonValue::Object(map.into_iter().map(|(k, v)| (k, JsonValue::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_boolean_literals() {
        assert_eq!(
            Value::coerce_from_wire(&JsonValue::String("True".into())),
            Value::Bool(true)
        );
        assert_eq!(
            Value::coerce_from_wire(&JsonValue::String("False".into())),
            Value::Bool(false)
        );
    }

    #[test]
    fn coerces_numeric_strings() {
        assert_eq!(
            Value::coerce_from_wire(&JsonValue::String("42".into())),
            Value::Int(42)
        );
        assert_eq!(
            Value::coerce_from_wire(&JsonValue::String("3.5".into())),
            Value::Float(3.5)
        );
    }

    #[test]
    fn falls_back_to_opaque_string() {
        assert_eq!(
            Value::coerce_from_wire(&JsonValue::String("hello".into())),
            Value::Str("hello".into())
        );
    }

    #[test]
    fn round_trips_through_json() {
        let original = Value::Map(BTreeMap::from([
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::List(vec![Value::Str("x".into())])),
        ]));
        let json: JsonValue = original.clone().into();
        let back: Value = json.into();
        assert_eq!(original, back);
    }
}
