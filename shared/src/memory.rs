use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use log::debug;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, watch};

use crate::buffers::BufferBundle;
use crate::record::ChangeRecord;
use crate::table::{EventKind, SharedTable, TableError, TableKey, TableState};
use crate::types::ModelId;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// In-process [`SharedTable`] implementation.
///
/// Serves two purposes: the table every scenario test runs against, and a
/// working single-process emulation of the replicated table for embeddings
/// that do not span processes. Delta writes merge into the cumulative state
/// row, and flushed change keys are broadcast to every subscriber,
/// including the writer itself, which is the at-least-once echo the change
/// sequencer exists to suppress.
pub struct MemoryTable {
    table_name: String,
    rows: Mutex<Rows>,
    state_tx: watch::Sender<TableState>,
    changes_tx: broadcast::Sender<TableKey>,
}

#[derive(Default)]
struct Rows {
    state: HashMap<ModelId, ChangeRecord>,
    value: HashMap<ModelId, ChangeRecord>,
    buffers: HashMap<ModelId, BufferBundle>,
    message: HashMap<ModelId, JsonValue>,
    dirty: Vec<TableKey>,
}

impl MemoryTable {
    pub fn new(table_name: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(TableState::Init);
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            table_name: table_name.into(),
            rows: Mutex::new(Rows::default()),
            state_tx,
            changes_tx,
        }
    }

    /// Signals the readiness transition. Idempotent; ignored once closed.
    pub fn set_ready(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == TableState::Init {
                *state = TableState::Ready;
                true
            } else {
                false
            }
        });
    }

    pub fn close(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == TableState::Closed {
                false
            } else {
                *state = TableState::Closed;
                true
            }
        });
    }

    /// Backend-side write of a model's full state row. Flushes immediately,
    /// the way remote writes surface here: as already-persisted changes.
    pub fn put_state(&self, record: ChangeRecord) {
        let key = self.key(&record.model_id, EventKind::State);
        {
            let mut rows = lock(&self.rows);
            rows.state.insert(record.model_id.clone(), record);
        }
        self.emit(key);
    }

    /// Backend-side write of a model's buffers row.
    pub fn put_buffers(&self, bundle: BufferBundle) {
        let key = self.key(&bundle.model_id, EventKind::Buffers);
        {
            let mut rows = lock(&self.rows);
            rows.buffers.insert(bundle.model_id.clone(), bundle);
        }
        self.emit(key);
    }

    /// Backend-side write of a custom message row.
    pub fn put_message(&self, model_id: &str, message: JsonValue) {
        let key = self.key(model_id, EventKind::Message);
        {
            let mut rows = lock(&self.rows);
            rows.message.insert(model_id.to_string(), message);
        }
        self.emit(key);
    }

    fn key(&self, model_id: &str, kind: EventKind) -> TableKey {
        TableKey::new(self.table_name.clone(), model_id.to_string(), kind)
    }

    fn emit(&self, key: TableKey) {
        // no subscribers yet is fine
        let _ = self.changes_tx.send(key);
    }
}

#[async_trait]
impl SharedTable for MemoryTable {
    fn state(&self) -> TableState {
        *self.state_tx.borrow()
    }

    fn state_changes(&self) -> watch::Receiver<TableState> {
        self.state_tx.subscribe()
    }

    fn changes(&self) -> broadcast::Receiver<TableKey> {
        self.changes_tx.subscribe()
    }

    fn keys(&self) -> Vec<(ModelId, EventKind)> {
        let rows = lock(&self.rows);
        let mut keys = Vec::new();
        keys.extend(rows.state.keys().map(|id| (id.clone(), EventKind::State)));
        keys.extend(rows.value.keys().map(|id| (id.clone(), EventKind::Value)));
        keys.extend(
            rows.buffers
                .keys()
                .map(|id| (id.clone(), EventKind::Buffers)),
        );
        keys.extend(
            rows.message
                .keys()
                .map(|id| (id.clone(), EventKind::Message)),
        );
        keys
    }

    fn get(&self, model_id: &str) -> Option<ChangeRecord> {
        lock(&self.rows).state.get(model_id).cloned()
    }

    fn get_value(&self, model_id: &str) -> Option<ChangeRecord> {
        lock(&self.rows).value.get(model_id).cloned()
    }

    fn get_buffers(&self, model_id: &str) -> BufferBundle {
        lock(&self.rows)
            .buffers
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| BufferBundle::empty(model_id.to_string()))
    }

    fn get_message(&self, model_id: &str) -> Option<JsonValue> {
        lock(&self.rows).message.get(model_id).cloned()
    }

    async fn set_value(
        &self,
        model_id: &str,
        record: ChangeRecord,
        persist_now: bool,
    ) -> Result<(), TableError> {
        if self.state() == TableState::Closed {
            return Err(TableError::Closed);
        }
        debug!(
            "set_value `{model_id}` last_changed={:?} persist_now={persist_now}",
            record.last_changed
        );
        let key = self.key(model_id, EventKind::Value);
        {
            let mut rows = lock(&self.rows);
            // deltas accumulate into the state row so `get` stays current;
            // the state row itself only ever comes from the backend
            if let Some(cumulative) = rows.state.get_mut(model_id) {
                for (state_key, value) in &record.changed {
                    cumulative.changed.insert(state_key.clone(), value.clone());
                }
                cumulative.last_changed = record.last_changed.or(cumulative.last_changed);
            }

            rows.value.insert(model_id.to_string(), record);
            if !persist_now {
                rows.dirty.push(key.clone());
            }
        }
        if persist_now {
            self.emit(key);
        }
        Ok(())
    }

    async fn save(&self) -> Result<(), TableError> {
        if self.state() == TableState::Closed {
            return Err(TableError::Closed);
        }
        let dirty = {
            let mut rows = lock(&self.rows);
            std::mem::take(&mut rows.dirty)
        };
        for key in dirty {
            self.emit(key);
        }
        Ok(())
    }
}

fn lock(rows: &Mutex<Rows>) -> std::sync::MutexGuard<'_, Rows> {
    rows.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use serde_json::json;

    fn record(model_id: &str, key: &str, value: i64, sequence: u64) -> ChangeRecord {
        let mut changed = crate::value::StateMap::new();
        changed.insert(key.to_string(), Value::Int(value));
        ChangeRecord::new(model_id.to_string(), changed, Some(sequence))
    }

    #[tokio::test]
    async fn writer_receives_its_own_flushed_keys() {
        let table = MemoryTable::new("widgets");
        table.set_ready();
        let mut changes = table.changes();

        table
            .set_value("m1", record("m1", "x", 1, 1), false)
            .await
            .expect("write");
        assert!(changes.try_recv().is_err(), "batched write must not emit");

        table.save().await.expect("save");
        let key = changes.try_recv().expect("flushed key");
        assert_eq!(key.model_id, "m1");
        assert_eq!(key.kind, EventKind::Value);
    }

    #[tokio::test]
    async fn deltas_merge_into_cumulative_state() {
        let table = MemoryTable::new("widgets");
        table.set_ready();

        table.put_state(record("m1", "x", 0, 0));
        table
            .set_value("m1", record("m1", "x", 1, 1), true)
            .await
            .expect("write");
        table
            .set_value("m1", record("m1", "y", 2, 2), true)
            .await
            .expect("write");

        let state = table.get("m1").expect("state row");
        assert_eq!(state.changed["x"], Value::Int(1));
        assert_eq!(state.changed["y"], Value::Int(2));
        assert_eq!(state.last_changed, Some(2));
    }

    #[tokio::test]
    async fn delta_without_state_row_does_not_create_one() {
        let table = MemoryTable::new("widgets");
        table.set_ready();

        table
            .set_value("m1", record("m1", "x", 1, 1), true)
            .await
            .expect("write");

        assert!(table.get("m1").is_none());
        assert!(table.get_value("m1").is_some());
    }

    #[tokio::test]
    async fn closed_table_rejects_writes() {
        let table = MemoryTable::new("widgets");
        table.set_ready();
        table.close();

        let err = table
            .set_value("m1", record("m1", "x", 1, 1), true)
            .await
            .expect_err("closed");
        assert_eq!(err, TableError::Closed);
        assert_eq!(table.save().await, Err(TableError::Closed));
    }

    #[tokio::test]
    async fn backend_puts_flush_immediately() {
        let table = MemoryTable::new("widgets");
        table.set_ready();
        let mut changes = table.changes();

        table.put_message("m1", json!({"op": "ping"}));
        let key = changes.try_recv().expect("message key");
        assert_eq!(key.kind, EventKind::Message);
        assert_eq!(table.get_message("m1"), Some(json!({"op": "ping"})));
    }

    #[test]
    fn readiness_transitions_are_one_way() {
        let table = MemoryTable::new("widgets");
        assert_eq!(table.state(), TableState::Init);
        table.set_ready();
        assert_eq!(table.state(), TableState::Ready);
        table.close();
        table.set_ready();
        assert_eq!(table.state(), TableState::Closed);
    }
}
