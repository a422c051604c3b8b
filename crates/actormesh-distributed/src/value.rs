//! The dynamic wire value (spec §4.7). Locally, a [`actormesh_process::Behavior`]'s
//! associated types stay strongly typed and never pass through here — only
//! messages crossing a node boundary (remote call/cast/spawn) convert to
//! and from [`Value`], the closed set the wire protocol actually carries.

use std::collections::BTreeMap;

use serde_json::{Number, Value as Json};

/// Every shape the wire format can carry. Plain JSON types round-trip
/// directly; the rest use the `{"$t": "...", "v": ...}` tagged wrapper
/// (spec §4.7) so a decoder can tell a `Date` from a string that merely
/// looks like one.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    /// JS numbers are one IEEE-754 double; `NaN`/`+-Infinity` are encoded
    /// with the same sentinel wrapper as the other non-JSON natives.
    Number(f64),
    String(String),
    Array(Vec<Value>),
    /// Insertion order is not semantically meaningful for a plain object,
    /// but is kept for a byte-stable encode of round-tripped values.
    Object(Vec<(String, Value)>),
    Date(i64),
    Error {
        name: String,
        message: String,
        stack: Option<String>,
    },
    /// Arbitrary precision, kept as a decimal string.
    BigInt(String),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    RegExp {
        source: String,
        flags: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("unsupported value encountered while encoding: {0}")]
    Encode(String),
    #[error("malformed wire value while decoding: {0}")]
    Decode(String),
}

const TAG_KEY: &str = "$t";
const VALUE_KEY: &str = "v";

impl Value {
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Undefined => tagged("undefined", Json::Null),
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => {
                if n.is_finite() {
                    Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null)
                } else if n.is_nan() {
                    tagged("number", Json::String("NaN".to_string()))
                } else if *n > 0.0 {
                    tagged("number", Json::String("Infinity".to_string()))
                } else {
                    tagged("number", Json::String("-Infinity".to_string()))
                }
            }
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(fields) => {
                let mut map = serde_json::Map::new();
                for (k, v) in fields {
                    map.insert(k.clone(), v.to_json());
                }
                Json::Object(map)
            }
            Value::Date(ms) => tagged("date", Json::Number((*ms).into())),
            Value::Error { name, message, stack } => {
                let mut map = serde_json::Map::new();
                map.insert("name".to_string(), Json::String(name.clone()));
                map.insert("message".to_string(), Json::String(message.clone()));
                if let Some(stack) = stack {
                    map.insert("stack".to_string(), Json::String(stack.clone()));
                }
                tagged("error", Json::Object(map))
            }
            Value::BigInt(digits) => tagged("bigint", Json::String(digits.clone())),
            Value::Map(entries) => {
                let pairs = entries
                    .iter()
                    .map(|(k, v)| Json::Array(vec![k.to_json(), v.to_json()]))
                    .collect();
                tagged("map", Json::Array(pairs))
            }
            Value::Set(items) => tagged("set", Json::Array(items.iter().map(Value::to_json).collect())),
            Value::RegExp { source, flags } => {
                let mut map = serde_json::Map::new();
                map.insert("source".to_string(), Json::String(source.clone()));
                map.insert("flags".to_string(), Json::String(flags.clone()));
                tagged("regexp", Json::Object(map))
            }
        }
    }

    pub fn from_json(json: &Json) -> Result<Value, SerializationError> {
        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => Ok(Value::Number(n.as_f64().ok_or_else(|| {
                SerializationError::Decode("number out of f64 range".to_string())
            })?)),
            Json::String(s) => Ok(Value::String(s.clone())),
            Json::Array(items) => Ok(Value::Array(
                items.iter().map(Value::from_json).collect::<Result<_, _>>()?,
            )),
            Json::Object(map) => {
                if let Some(tag) = map.get(TAG_KEY).and_then(Json::as_str) {
                    return decode_tagged(tag, map);
                }
                let mut fields = Vec::with_capacity(map.len());
                for (k, v) in map {
                    fields.push((k.clone(), Value::from_json(v)?));
                }
                Ok(Value::Object(fields))
            }
        }
    }
}

fn tagged(tag: &str, value: Json) -> Json {
    let mut map = serde_json::Map::new();
    map.insert(TAG_KEY.to_string(), Json::String(tag.to_string()));
    map.insert(VALUE_KEY.to_string(), value);
    Json::Object(map)
}

fn decode_tagged(tag: &str, map: &serde_json::Map<String, Json>) -> Result<Value, SerializationError> {
    let bad = |msg: &str| SerializationError::Decode(format!("{tag}: {msg}"));
    match tag {
        "undefined" => Ok(Value::Undefined),
        "number" => {
            let s = map.get(VALUE_KEY).and_then(Json::as_str).ok_or_else(|| bad("missing v"))?;
            match s {
                "NaN" => Ok(Value::Number(f64::NAN)),
                "Infinity" => Ok(Value::Number(f64::INFINITY)),
                "-Infinity" => Ok(Value::Number(f64::NEG_INFINITY)),
                _ => Err(bad("unrecognized number sentinel")),
            }
        }
        "date" => {
            let ms = map.get(VALUE_KEY).and_then(Json::as_i64).ok_or_else(|| bad("missing v"))?;
            Ok(Value::Date(ms))
        }
        "error" => {
            let obj = map.get(VALUE_KEY).and_then(Json::as_object).ok_or_else(|| bad("missing v"))?;
            let name = field_str(obj, "name").ok_or_else(|| bad("missing name"))?;
            let message = field_str(obj, "message").ok_or_else(|| bad("missing message"))?;
            let stack = obj.get("stack").and_then(Json::as_str).map(str::to_string);
            Ok(Value::Error { name, message, stack })
        }
        "bigint" => {
            let digits = map.get(VALUE_KEY).and_then(Json::as_str).ok_or_else(|| bad("missing v"))?;
            Ok(Value::BigInt(digits.to_string()))
        }
        "map" => {
            let entries = map.get(VALUE_KEY).and_then(Json::as_array).ok_or_else(|| bad("missing v"))?;
            let mut out = Vec::with_capacity(entries.len());
            for entry in entries {
                let pair = entry.as_array().ok_or_else(|| bad("entry is not a pair"))?;
                let [k, v] = <[Json; 2]>::try_from(pair.clone()).map_err(|_| bad("entry is not a pair"))?;
                out.push((Value::from_json(&k)?, Value::from_json(&v)?));
            }
            Ok(Value::Map(out))
        }
        "set" => {
            let items = map.get(VALUE_KEY).and_then(Json::as_array).ok_or_else(|| bad("missing v"))?;
            Ok(Value::Set(
                items.iter().map(Value::from_json).collect::<Result<_, _>>()?,
            ))
        }
        "regexp" => {
            let obj = map.get(VALUE_KEY).and_then(Json::as_object).ok_or_else(|| bad("missing v"))?;
            let source = field_str(obj, "source").ok_or_else(|| bad("missing source"))?;
            let flags = field_str(obj, "flags").ok_or_else(|| bad("missing flags"))?;
            Ok(Value::RegExp { source, flags })
        }
        other => Err(SerializationError::Decode(format!("unknown tag {other}"))),
    }
}

fn field_str(obj: &serde_json::Map<String, Json>, key: &str) -> Option<String> {
    obj.get(key).and_then(Json::as_str).map(str::to_string)
}

/// Canonical JSON used for HMAC signing (spec §6): object keys sorted
/// lexicographically, no insignificant whitespace, UTF-8. `serde_json`'s
/// default `Map` is already key-sorted (it is `BTreeMap`-backed unless the
/// `preserve_order` feature is enabled, which this crate does not enable),
/// so a compact `to_vec` is already canonical.
pub fn canonical_json_bytes(json: &Json) -> Vec<u8> {
    fn sort(json: &Json) -> Json {
        match json {
            Json::Object(map) => {
                let sorted: BTreeMap<String, Json> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                Json::Object(sorted.into_iter().collect())
            }
            Json::Array(items) => Json::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_vec(&sort(json)).expect("Value::to_json never produces non-serializable JSON")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) {
        let json = v.to_json();
        let decoded = Value::from_json(&json).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn plain_json_roundtrips() {
        roundtrip(Value::Null);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Number(42.5));
        roundtrip(Value::String("hi".to_string()));
        roundtrip(Value::Array(vec![Value::Number(1.0), Value::Bool(false)]));
        roundtrip(Value::Object(vec![("k".to_string(), Value::String("v".to_string()))]));
    }

    #[test]
    fn natives_roundtrip_through_tagged_wrapper() {
        roundtrip(Value::Undefined);
        roundtrip(Value::Number(f64::NAN));
        roundtrip(Value::Number(f64::INFINITY));
        roundtrip(Value::Number(f64::NEG_INFINITY));
        roundtrip(Value::Date(1_706_000_000_000));
        roundtrip(Value::Error {
            name: "Error".to_string(),
            message: "boom".to_string(),
            stack: None,
        });
        roundtrip(Value::BigInt("9007199254740993".to_string()));
        roundtrip(Value::Map(vec![(Value::String("k".to_string()), Value::String("v".to_string()))]));
        roundtrip(Value::Set(vec![Value::Number(1.0), Value::Number(2.0)]));
        roundtrip(Value::RegExp {
            source: "a+".to_string(),
            flags: "gi".to_string(),
        });
    }

    #[test]
    fn nan_does_not_equal_itself_via_f64_but_tag_roundtrips() {
        let json = Value::Number(f64::NAN).to_json();
        match Value::from_json(&json).unwrap() {
            Value::Number(n) => assert!(n.is_nan()),
            other => panic!("expected Number(NaN), got {other:?}"),
        }
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let json = serde_json::json!({"b": 1, "a": 2});
        let bytes = canonical_json_bytes(&json);
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":2,"b":1}"#);
    }
}
