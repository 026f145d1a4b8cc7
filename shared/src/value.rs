use std::collections::HashMap;

use bytes::Bytes;
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

use crate::types::ModelId;

/// Fixed 10-character prefix tagging a string state value as a pointer to
/// another model's id. This is the entire wire contract for cross-model
/// references and must match what the backend emits byte-for-byte.
pub const REFERENCE_PREFIX: &str = "IPY_MODEL_";

/// Reference placeholders are only expected on a value directly under a
/// state key, or one level further inside an array or object. Prefixed
/// strings nested deeper than this are left as plain strings.
pub const REFERENCE_MAX_DEPTH: usize = 2;

/// One model's state, or one delta against it: a mapping from state keys to
/// values. `R` is the reference representation: [`ModelId`] on the wire,
/// a live handle once resolved.
pub type StateMap<R> = HashMap<String, Value<R>>;

/// A JSON-shaped state value, with two extensions the wire format cannot
/// express directly: binary payloads merged out-of-band, and typed
/// cross-model references.
///
/// Tagging references at ingestion makes "an update with any unresolved
/// reference is dropped whole" a structural property of resolution rather
/// than a flag someone has to remember to check.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<R> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Merged binary payload. Never travels through the JSON column; the
    /// buffers column carries the bytes and they are spliced in locally.
    Bytes(Bytes),
    Array(Vec<Value<R>>),
    Object(HashMap<String, Value<R>>),
    /// Deferred pointer to another model.
    Reference(R),
}

impl<R> Value<R> {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Maps every reference in this value through `resolve_ref`, rebuilding
    /// the tree with the new reference representation. Returns `None` as
    /// soon as any single reference fails to resolve: a partially resolved
    /// value never escapes.
    pub fn resolve<R2>(
        &self,
        resolve_ref: &mut impl FnMut(&R) -> Option<R2>,
    ) -> Option<Value<R2>> {
        Some(match self {
            Value::Null => Value::Null,
            Value::Bool(b) => Value::Bool(*b),
            Value::Int(i) => Value::Int(*i),
            Value::Float(f) => Value::Float(*f),
            Value::Str(s) => Value::Str(s.clone()),
            Value::Bytes(bytes) => Value::Bytes(bytes.clone()),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.resolve(resolve_ref))
                    .collect::<Option<Vec<_>>>()?,
            ),
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, field)| Some((key.clone(), field.resolve(resolve_ref)?)))
                    .collect::<Option<HashMap<_, _>>>()?,
            ),
            Value::Reference(reference) => Value::Reference(resolve_ref(reference)?),
        })
    }

    /// Collects every reference in this value, depth-first.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a R>) {
        match self {
            Value::Array(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Value::Object(fields) => {
                for field in fields.values() {
                    field.collect_references(out);
                }
            }
            Value::Reference(reference) => out.push(reference),
            _ => {}
        }
    }
}

impl Value<ModelId> {
    /// Parses a wire value sitting directly under a state key. Strings
    /// carrying [`REFERENCE_PREFIX`] become [`Value::Reference`] down to
    /// [`REFERENCE_MAX_DEPTH`]; deeper ones stay strings, matching the
    /// depth the resolver covers.
    pub fn from_json(json: &JsonValue) -> Self {
        Self::from_json_at(json, 1)
    }

    fn from_json_at(json: &JsonValue, depth: usize) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => {
                if depth <= REFERENCE_MAX_DEPTH {
                    if let Some(model_id) = parse_reference(s) {
                        return Value::Reference(model_id);
                    }
                }
                Value::Str(s.clone())
            }
            JsonValue::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| Self::from_json_at(item, depth + 1))
                    .collect(),
            ),
            JsonValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, field)| (key.clone(), Self::from_json_at(field, depth + 1)))
                    .collect(),
            ),
        }
    }

    /// Re-emits the wire form. References become prefixed strings again,
    /// byte-identical to what was ingested; binary payloads become `null`
    /// since they travel through the buffers column only.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::Number(Number::from(*i)),
            Value::Float(f) => Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Str(s) => JsonValue::String(s.clone()),
            Value::Bytes(_) => JsonValue::Null,
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(fields) => JsonValue::Object(
                fields
                    .iter()
                    .map(|(key, field)| (key.clone(), field.to_json()))
                    .collect::<JsonMap<String, JsonValue>>(),
            ),
            Value::Reference(model_id) => {
                JsonValue::String(format!("{REFERENCE_PREFIX}{model_id}"))
            }
        }
    }
}

/// Parses a wire state object into a [`StateMap`].
pub fn state_from_json(json: &JsonMap<String, JsonValue>) -> StateMap<ModelId> {
    json.iter()
        .map(|(key, value)| (key.clone(), Value::from_json(value)))
        .collect()
}

/// Serializes a [`StateMap`] back into its wire form.
pub fn state_to_json(state: &StateMap<ModelId>) -> JsonMap<String, JsonValue> {
    state
        .iter()
        .map(|(key, value)| (key.clone(), value.to_json()))
        .collect()
}

fn parse_reference(s: &str) -> Option<ModelId> {
    s.strip_prefix(REFERENCE_PREFIX).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(json: JsonValue) -> Value<ModelId> {
        Value::from_json(&json)
    }

    #[test]
    fn scalar_round_trip() {
        for json in [json!(null), json!(true), json!(3), json!(2.5), json!("x")] {
            assert_eq!(parse(json.clone()).to_json(), json);
        }
    }

    #[test]
    fn reference_tagged_at_top_level() {
        let value = parse(json!("IPY_MODEL_abc123"));
        assert_eq!(value, Value::Reference("abc123".to_string()));
        assert_eq!(value.to_json(), json!("IPY_MODEL_abc123"));
    }

    #[test]
    fn reference_tagged_inside_array_and_object() {
        let value = parse(json!(["IPY_MODEL_a", "plain"]));
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Reference("a".to_string()),
                Value::Str("plain".to_string()),
            ])
        );

        let value = parse(json!({"target": "IPY_MODEL_b"}));
        let Value::Object(fields) = value else {
            panic!("expected object");
        };
        assert_eq!(fields["target"], Value::Reference("b".to_string()));
    }

    #[test]
    fn deep_prefixed_string_stays_a_string() {
        // depth 3: under a key, inside an object, inside another object
        let value = parse(json!({"inner": {"deep": "IPY_MODEL_c"}}));
        let Value::Object(fields) = value else {
            panic!("expected object");
        };
        let Value::Object(inner) = &fields["inner"] else {
            panic!("expected nested object");
        };
        assert_eq!(inner["deep"], Value::Str("IPY_MODEL_c".to_string()));
        // and the wire form is untouched
    }

    #[test]
    fn bytes_serialize_to_null() {
        let value: Value<ModelId> = Value::Bytes(Bytes::from_static(b"\x01\x02"));
        assert_eq!(value.to_json(), json!(null));
    }

    #[test]
    fn resolve_is_all_or_nothing() {
        let value = parse(json!(["IPY_MODEL_known", "IPY_MODEL_unknown"]));
        let resolved = value.resolve(&mut |id: &ModelId| {
            if id == "known" {
                Some(id.clone())
            } else {
                None
            }
        });
        assert!(resolved.is_none());
    }

    #[test]
    fn collect_references_walks_nested_values() {
        let value = parse(json!(["IPY_MODEL_a", {"child": "IPY_MODEL_b"}]));
        let mut refs = Vec::new();
        value.collect_references(&mut refs);
        let mut ids: Vec<&str> = refs.iter().map(|id| id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, ["a", "b"]);
    }
}
