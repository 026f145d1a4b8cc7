use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::buffers::BufferBundle;
use crate::record::ChangeRecord;
use crate::types::ModelId;

/// Lifecycle of the shared table as seen by this session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableState {
    Init,
    Ready,
    Closed,
}

/// The four kinds of rows a model owns in the shared table, and therefore
/// the four kinds of change events the engine dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    State,
    Value,
    Buffers,
    Message,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::State => "state",
            EventKind::Value => "value",
            EventKind::Buffers => "buffers",
            EventKind::Message => "message",
        }
    }

    pub fn parse(kind: &str) -> Result<Self, TableError> {
        match kind {
            "state" => Ok(EventKind::State),
            "value" => Ok(EventKind::Value),
            "buffers" => Ok(EventKind::Buffers),
            "message" => Ok(EventKind::Message),
            _ => Err(TableError::UnknownKind {
                kind: kind.to_string(),
            }),
        }
    }
}

/// Decomposed form of one opaque table change key. On the wire a key is the
/// JSON array `[table_name, model_id, kind]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableKey {
    pub table_name: String,
    pub model_id: ModelId,
    pub kind: EventKind,
}

impl TableKey {
    pub fn new(table_name: String, model_id: ModelId, kind: EventKind) -> Self {
        Self {
            table_name,
            model_id,
            kind,
        }
    }

    pub fn decode(raw: &str) -> Result<Self, TableError> {
        let (table_name, model_id, kind): (String, String, String) =
            serde_json::from_str(raw).map_err(|_| TableError::MalformedKey {
                raw: raw.to_string(),
            })?;
        Ok(Self::new(table_name, model_id, EventKind::parse(&kind)?))
    }

    pub fn encode(&self) -> String {
        serde_json::json!([self.table_name, self.model_id, self.kind.as_str()]).to_string()
    }
}

/// Errors reported by the shared table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    /// A change key could not be decomposed into `(table, model, kind)`.
    #[error("malformed table key `{raw}`")]
    MalformedKey { raw: String },

    /// A change key carried an event kind this engine does not know.
    #[error("unknown event kind `{kind}`")]
    UnknownKind { kind: String },

    /// The table is closed; all reads and writes are rejected.
    #[error("shared table is closed")]
    Closed,
}

/// The externally provided, eventually-consistent, ordered key/value table
/// that is the sole transport between clients and the backend.
///
/// Reads are served from the local replica and are synchronous; writes are
/// write-then-flush (`set_value` with `persist_now = false` batches until
/// the next `save`). Change notification is a broadcast of opaque keys.
#[async_trait]
pub trait SharedTable: Send + Sync {
    fn state(&self) -> TableState;

    /// Readiness transitions, including the final transition to `Closed`.
    fn state_changes(&self) -> watch::Receiver<TableState>;

    /// Change notifications, delivered at-least-once to every subscriber,
    /// including the writer itself.
    fn changes(&self) -> broadcast::Receiver<TableKey>;

    /// All `(model_id, kind)` pairs currently known to the table.
    fn keys(&self) -> Vec<(ModelId, EventKind)>;

    /// Current full state for a model, if any has arrived.
    fn get(&self, model_id: &str) -> Option<ChangeRecord>;

    /// Latest state delta written for a model.
    fn get_value(&self, model_id: &str) -> Option<ChangeRecord>;

    /// Out-of-band binary payloads for a model. Never fails; a model with
    /// no buffers yields an empty bundle.
    fn get_buffers(&self, model_id: &str) -> BufferBundle;

    /// Latest custom message payload for a model.
    fn get_message(&self, model_id: &str) -> Option<JsonValue>;

    async fn set_value(
        &self,
        model_id: &str,
        record: ChangeRecord,
        persist_now: bool,
    ) -> Result<(), TableError>;

    /// Flushes all writes batched since the last flush.
    async fn save(&self) -> Result<(), TableError>;
}
