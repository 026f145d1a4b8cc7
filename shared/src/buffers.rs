use std::collections::HashMap;

use bytes::Bytes;

use crate::types::ModelId;
use crate::value::{StateMap, Value};

/// One step into a nested state value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Location of one binary payload inside a model's state.
pub type BufferPath = Vec<PathSegment>;

/// Out-of-band binary payloads for one model, positionally aligned with the
/// nested locations they belong at. Buffers never travel through the JSON
/// column; they are spliced into a state snapshot locally before the
/// snapshot is handed to deserialization.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferBundle {
    pub model_id: ModelId,
    pub buffer_paths: Vec<BufferPath>,
    pub buffers: Vec<Bytes>,
}

impl BufferBundle {
    pub fn new(model_id: ModelId, buffer_paths: Vec<BufferPath>, buffers: Vec<Bytes>) -> Self {
        Self {
            model_id,
            buffer_paths,
            buffers,
        }
    }

    pub fn empty(model_id: ModelId) -> Self {
        Self::new(model_id, Vec::new(), Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.buffer_paths.is_empty()
    }
}

/// Splices each `(path, buffer)` pair into `state`, creating intermediate
/// containers along the way: a missing or mismatched step becomes an empty
/// object (or the array is padded with nulls for an index step). Buffers may
/// arrive before the structure that contains them exists, so out-of-order
/// construction converges instead of failing.
pub fn merge_buffers<R>(state: &mut StateMap<R>, paths: &[BufferPath], buffers: &[Bytes]) {
    for (path, buffer) in paths.iter().zip(buffers.iter()) {
        // the state root is keyed, so the first segment must be a key
        let Some(PathSegment::Key(root_key)) = path.first() else {
            continue;
        };
        let mut slot = state.entry(root_key.clone()).or_insert(Value::Null);
        for segment in &path[1..] {
            slot = ensure_child(slot, segment);
        }
        *slot = Value::Bytes(buffer.clone());
    }
}

/// The variant used when re-deserializing a state snapshot: pairs whose
/// first path segment names a state key that is absent or null are skipped,
/// the rest merged. A buffer for a key the snapshot does not carry belongs
/// to a later update.
pub fn merge_present_buffers<R>(state: &mut StateMap<R>, bundle: &BufferBundle) {
    let mut paths = Vec::new();
    let mut buffers = Vec::new();
    for (path, buffer) in bundle.buffer_paths.iter().zip(bundle.buffers.iter()) {
        let Some(PathSegment::Key(root_key)) = path.first() else {
            continue;
        };
        match state.get(root_key) {
            None | Some(Value::Null) => continue,
            Some(_) => {
                paths.push(path.clone());
                buffers.push(buffer.clone());
            }
        }
    }
    merge_buffers(state, &paths, &buffers);
}

fn ensure_child<'a, R>(value: &'a mut Value<R>, segment: &PathSegment) -> &'a mut Value<R> {
    match segment {
        PathSegment::Key(key) => {
            if !matches!(value, Value::Object(_)) {
                *value = Value::Object(HashMap::new());
            }
            let Value::Object(fields) = value else {
                unreachable!()
            };
            fields.entry(key.clone()).or_insert(Value::Null)
        }
        PathSegment::Index(index) => {
            if !matches!(value, Value::Array(_)) {
                *value = Value::Array(Vec::new());
            }
            let Value::Array(items) = value else {
                unreachable!()
            };
            while items.len() <= *index {
                items.push(Value::Null);
            }
            &mut items[*index]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> PathSegment {
        PathSegment::Key(s.to_string())
    }

    #[test]
    fn merge_into_empty_state_creates_intermediates() {
        let mut state: StateMap<ModelId> = StateMap::new();
        let payload = Bytes::from_static(b"\xde\xad\xbe\xef");
        merge_buffers(
            &mut state,
            &[vec![key("a"), key("b")]],
            &[payload.clone()],
        );

        let Value::Object(a) = &state["a"] else {
            panic!("intermediate `a` should be created as an empty object");
        };
        assert_eq!(a["b"].as_bytes(), Some(&payload));
    }

    #[test]
    fn merged_bytes_read_back_identical() {
        let mut state: StateMap<ModelId> = StateMap::new();
        let payload = Bytes::from(vec![0u8, 1, 2, 255]);
        merge_buffers(&mut state, &[vec![key("img")]], &[payload.clone()]);
        assert_eq!(state["img"].as_bytes(), Some(&payload));
    }

    #[test]
    fn merge_replaces_null_leaf_and_keeps_siblings() {
        let mut state: StateMap<ModelId> = StateMap::new();
        state.insert("img".to_string(), Value::Null);
        state.insert("label".to_string(), Value::Str("x".to_string()));

        let payload = Bytes::from_static(b"png");
        merge_buffers(&mut state, &[vec![key("img")]], &[payload.clone()]);

        assert_eq!(state["img"].as_bytes(), Some(&payload));
        assert_eq!(state["label"], Value::Str("x".to_string()));
    }

    #[test]
    fn index_segment_pads_array() {
        let mut state: StateMap<ModelId> = StateMap::new();
        let payload = Bytes::from_static(b"b");
        merge_buffers(
            &mut state,
            &[vec![key("frames"), PathSegment::Index(2)]],
            &[payload.clone()],
        );

        let Value::Array(frames) = &state["frames"] else {
            panic!("expected array");
        };
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], Value::Null);
        assert_eq!(frames[2].as_bytes(), Some(&payload));
    }

    #[test]
    fn present_filter_skips_absent_and_null_keys() {
        let mut state: StateMap<ModelId> = StateMap::new();
        state.insert("kept".to_string(), Value::Str("v".to_string()));
        state.insert("nulled".to_string(), Value::Null);

        let bundle = BufferBundle::new(
            "m".to_string(),
            vec![vec![key("kept")], vec![key("nulled")], vec![key("absent")]],
            vec![
                Bytes::from_static(b"1"),
                Bytes::from_static(b"2"),
                Bytes::from_static(b"3"),
            ],
        );
        merge_present_buffers(&mut state, &bundle);

        assert!(state["kept"].as_bytes().is_some());
        assert_eq!(state["nulled"], Value::Null);
        assert!(!state.contains_key("absent"));
    }
}
