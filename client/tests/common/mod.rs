#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use widgetsync_client::{
    ChangeRecord, CommMessage, MemoryTable, MessageSender, ModelHandle, SchemaRegistry,
    SendError, StateMap, SyncEngine, Value,
};

/// Message sender that records every outbound custom message.
pub struct RecordingSender {
    sent: Mutex<Vec<CommMessage>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<CommMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send_custom_message(&self, message: CommMessage) -> Result<(), SendError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

pub fn setup() -> (Arc<MemoryTable>, Arc<RecordingSender>, SyncEngine) {
    setup_with_schemas(SchemaRegistry::new())
}

pub fn setup_with_schemas(
    schemas: SchemaRegistry,
) -> (Arc<MemoryTable>, Arc<RecordingSender>, SyncEngine) {
    let table = Arc::new(MemoryTable::new("widgets"));
    let sender = Arc::new(RecordingSender::new());
    let engine = SyncEngine::new(table.clone(), sender.clone(), schemas).expect("engine");
    (table, sender, engine)
}

pub fn spawn_engine(engine: &SyncEngine) {
    let engine = engine.clone();
    tokio::spawn(async move { engine.run().await });
}

/// Lets every woken task make progress. The runtime is single-threaded and
/// nothing here sleeps on a timer, so a bounded number of yields settles
/// all in-flight work.
pub async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

/// A wire record with an explicit sequence number.
pub fn record(model_id: &str, fields: JsonValue, last_changed: u64) -> ChangeRecord {
    let mut record = ChangeRecord::from_json(model_id.to_string(), &fields);
    record.last_changed = Some(last_changed);
    record
}

/// A full-state record carrying the reserved module keys every widget
/// state starts with.
pub fn widget_state(
    model_id: &str,
    model_name: &str,
    extra: JsonValue,
    last_changed: u64,
) -> ChangeRecord {
    let mut fields = serde_json::json!({
        "_model_name": model_name,
        "_model_module": "widgets",
        "_model_module_version": "1.0",
    });
    if let (Some(target), Some(source)) = (fields.as_object_mut(), extra.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
    record(model_id, fields, last_changed)
}

pub fn resolved_state(pairs: Vec<(&str, Value<ModelHandle>)>) -> StateMap<ModelHandle> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
