use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::types::{ModelId, SequenceNumber};
use crate::value::{state_from_json, state_to_json, StateMap};

/// Reserved state key carrying the sequence number on the wire. The field
/// rides inside the changed map, next to ordinary state keys.
const LAST_CHANGED_KEY: &str = "last_changed";

/// One state delta for one model, either remotely observed or locally
/// produced. `last_changed` is the sole conflict-resolution signal; records
/// written by this engine always carry it, but a record without one is
/// tolerated and applied without sequencer bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub model_id: ModelId,
    pub changed: StateMap<ModelId>,
    pub last_changed: Option<SequenceNumber>,
}

impl ChangeRecord {
    pub fn new(
        model_id: ModelId,
        changed: StateMap<ModelId>,
        last_changed: Option<SequenceNumber>,
    ) -> Self {
        Self {
            model_id,
            changed,
            last_changed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    /// Parses a record from its wire object. A non-object payload yields an
    /// empty record rather than failing: the table is eventually consistent
    /// and a torn row must not take the engine down.
    pub fn from_json(model_id: ModelId, json: &JsonValue) -> Self {
        let Some(fields) = json.as_object() else {
            return Self::new(model_id, StateMap::new(), None);
        };
        let last_changed = fields.get(LAST_CHANGED_KEY).and_then(JsonValue::as_u64);
        let mut fields = fields.clone();
        fields.remove(LAST_CHANGED_KEY);
        Self::new(model_id, state_from_json(&fields), last_changed)
    }

    pub fn to_json(&self) -> JsonValue {
        let mut fields: JsonMap<String, JsonValue> = state_to_json(&self.changed);
        if let Some(sequence) = self.last_changed {
            fields.insert(LAST_CHANGED_KEY.to_string(), JsonValue::from(sequence));
        }
        JsonValue::Object(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use serde_json::json;

    #[test]
    fn wire_round_trip() {
        let record = ChangeRecord::from_json(
            "m1".to_string(),
            &json!({"x": 2, "label": "hi", "last_changed": 7}),
        );
        assert_eq!(record.last_changed, Some(7));
        assert_eq!(record.changed["x"], Value::Int(2));
        assert!(!record.changed.contains_key("last_changed"));

        let json = record.to_json();
        assert_eq!(json["last_changed"], json!(7));
        assert_eq!(json["x"], json!(2));
    }

    #[test]
    fn missing_sequence_number_is_tolerated() {
        let record = ChangeRecord::from_json("m1".to_string(), &json!({"x": 1}));
        assert_eq!(record.last_changed, None);
        assert_eq!(record.changed.len(), 1);
    }

    #[test]
    fn torn_row_parses_to_empty_record() {
        let record = ChangeRecord::from_json("m1".to_string(), &json!("garbage"));
        assert!(record.is_empty());
        assert_eq!(record.last_changed, None);
    }
}
