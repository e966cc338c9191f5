// Copyright 2020 Joyent, Inc.

//! Conversion between [`Value`] and `serde_json::Value`, for tools that
//! take arguments or print results as JSON.

use std::collections::HashMap;

use serde_json::{Map, Number};

use crate::value::{Int64, Uint64, Value};

/// Convert a JSON document to a value. Negative integers become Int64,
/// other integers Uint64 and everything else numeric Float64. Returns
/// `None` for numbers the codec cannot carry.
pub fn from_json(json: serde_json::Value) -> Option<Value> {
    Some(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => from_number(&n)?,
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(from_json)
                .collect::<Option<Vec<Value>>>()?,
        ),
        serde_json::Value::Object(fields) => Value::Map(
            fields
                .into_iter()
                .map(|(k, v)| from_json(v).map(|v| (k, v)))
                .collect::<Option<HashMap<String, Value>>>()?,
        ),
    })
}

fn from_number(n: &Number) -> Option<Value> {
    if let Some(u) = n.as_u64() {
        Some(Value::Uint64(Uint64::new(u)))
    } else if let Some(i) = n.as_i64() {
        Some(Value::Int64(Int64::new(i)))
    } else {
        n.as_f64().filter(|f| !f.is_nan()).map(Value::Float64)
    }
}

pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Float64(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Int64(i) => serde_json::Value::from(i.raw_value()),
        Value::Uint64(u) => serde_json::Value::from(u.raw_value()),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::Array(
            b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
        ),
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(to_json).collect())
        }
        Value::Map(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect::<Map<String, serde_json::Value>>(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn numbers_pick_a_kind() {
        assert_eq!(from_json(json!(7)), Some(Value::from(7u64)));
        assert_eq!(from_json(json!(-7)), Some(Value::from(-7i64)));
        assert_eq!(from_json(json!(1.5)), Some(Value::from(1.5)));
    }

    #[test]
    fn nested_documents() {
        let doc = json!({"name": "x", "tags": ["a", null, true], "n": -1});
        let value = from_json(doc.clone()).expect("convert");
        match &value {
            Value::Map(m) => {
                assert_eq!(m["name"], Value::from("x"));
                assert_eq!(
                    m["tags"],
                    Value::Array(vec![
                        Value::from("a"),
                        Value::Null,
                        Value::from(true)
                    ])
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(to_json(&value), doc);
    }

    #[test]
    fn wide_values() {
        assert_eq!(to_json(&Value::Bytes(vec![1, 255])), json!([1, 255]));
        assert_eq!(
            to_json(&Value::from(u64::max_value())),
            json!(u64::max_value())
        );
        assert_eq!(
            to_json(&Value::from(i64::min_value())),
            json!(i64::min_value())
        );
    }
}
