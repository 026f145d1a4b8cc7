use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use log::{debug, info, warn};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use widgetsync_shared::{
    merge_buffers, ChangeRecord, EventKind, MessageSender, ModelId, PathSegment, SequenceNumber,
    SharedTable, StateMap, TableError, TableKey, TableState,
};

use crate::comm::CommChannel;
use crate::dereference::dereference_links;
use crate::error::SyncError;
use crate::model::registry::ModelRegistry;
use crate::model::schema::SchemaRegistry;
use crate::model::{LocalChange, Model, ModelHandle};
use crate::sequencer::{ChangeSequencer, RemoteVerdict};

/// Target name the backend registers its widget comm handler under.
const WIDGET_COMM_TARGET: &str = "jupyter.widget";

/// Bound on queued-but-unpublished local changes. A model's `set` suspends
/// when the queue is full, which is what keeps local writes ordered with
/// at most one publish in flight.
const LOCAL_CHANGE_QUEUE: usize = 64;

/// The widget-state synchronization engine for one session.
///
/// Turns raw table change events into model mutations, and model mutations
/// back into table writes, while suppressing the echo of its own writes.
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    table: Arc<dyn SharedTable>,
    sender: Arc<dyn MessageSender>,
    registry: ModelRegistry,
    sequencer: Arc<StdMutex<ChangeSequencer>>,
    watching: StdMutex<HashSet<ModelId>>,
    local_rx: StdMutex<Option<mpsc::Receiver<LocalChange>>>,
    created_rx: StdMutex<Option<mpsc::UnboundedReceiver<Arc<Model>>>>,
}

impl SyncEngine {
    pub fn new(
        table: Arc<dyn SharedTable>,
        sender: Arc<dyn MessageSender>,
        schemas: SchemaRegistry,
    ) -> Result<Self, SyncError> {
        if table.state() == TableState::Closed {
            return Err(SyncError::Table(TableError::Closed));
        }
        let (local_tx, local_rx) = mpsc::channel(LOCAL_CHANGE_QUEUE);
        let (created_tx, created_rx) = mpsc::unbounded_channel();
        let sequencer = Arc::new(StdMutex::new(ChangeSequencer::new()));
        let registry = ModelRegistry::new(
            table.clone(),
            schemas,
            sequencer.clone(),
            local_tx,
            created_tx,
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                table,
                sender,
                registry,
                sequencer,
                watching: StdMutex::new(HashSet::new()),
                local_rx: StdMutex::new(Some(local_rx)),
                created_rx: StdMutex::new(Some(created_rx)),
            }),
        })
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    /// The locally tracked sequence number for a model, if any.
    pub fn last_changed(&self, model_id: &str) -> Option<SequenceNumber> {
        lock(&self.inner.sequencer).tracked_sequence(model_id)
    }

    /// Drives the engine until the session closes: table change
    /// notifications dispatch to handlers, newly created models get
    /// watched, and queued local changes get published. Spawn this once.
    pub async fn run(&self) {
        let Some(mut local_rx) = lock(&self.inner.local_rx).take() else {
            warn!("sync engine run() called more than once");
            return;
        };
        let Some(mut created_rx) = lock(&self.inner.created_rx).take() else {
            warn!("sync engine run() called more than once");
            return;
        };
        let mut changes = self.inner.table.changes();
        let mut states = self.inner.table.state_changes();

        loop {
            tokio::select! {
                key = changes.recv() => match key {
                    Ok(key) => self.spawn_change(key),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("lagged behind table change notifications, skipped {skipped}");
                    }
                    Err(RecvError::Closed) => break,
                },
                state = states.changed() => {
                    if state.is_err() || *states.borrow_and_update() == TableState::Closed {
                        break;
                    }
                }
                created = created_rx.recv() => {
                    if let Some(model) = created {
                        self.watch_model(&model).await;
                    }
                }
                local = local_rx.recv() => {
                    if let Some(change) = local {
                        if let Err(err) = self.publish_local_change(change).await {
                            warn!("failed to publish local change: {err}");
                        }
                    }
                }
            }
        }
        debug!("sync engine loop ended");
    }

    /// Each event gets its own task: a handler may suspend waiting for a
    /// model to materialize, and that must not stall delivery of the very
    /// event that would let it finish.
    fn spawn_change(&self, key: TableKey) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.process_change(&key).await {
                warn!(
                    "failed to process {} change for model `{}`: {err}",
                    key.kind.as_str(),
                    key.model_id
                );
            }
        });
    }

    /// Dispatches one table change event by kind.
    pub async fn process_change(&self, key: &TableKey) -> Result<(), SyncError> {
        debug!("table change: {} `{}`", key.kind.as_str(), key.model_id);
        match key.kind {
            EventKind::State => self.state_change(&key.model_id).await,
            EventKind::Value => self.value_change(&key.model_id).await,
            EventKind::Buffers => self.buffers_change(&key.model_id).await,
            EventKind::Message => self.message_change(&key.model_id).await,
        }
    }

    /// Returns the model, creating and watching it if needed. This is the
    /// entry point a renderer uses.
    pub async fn get_model(&self, model_id: &str) -> Result<Arc<Model>, SyncError> {
        let model = self.inner.registry.get_or_create(model_id).await?;
        self.watch_model(&model).await;
        Ok(model)
    }

    /// Attaches live local-change forwarding and a comm channel to a model,
    /// creating it first if needed. Idempotent.
    pub async fn watch(&self, model_id: &str) -> Result<(), SyncError> {
        let model = self.inner.registry.get_or_create(model_id).await?;
        self.watch_model(&model).await;
        Ok(())
    }

    /// Eagerly materializes every model the table already knows about, so a
    /// fresh session renders without a detect-on-demand round trip per
    /// widget. Materializations are independent: one failing is logged and
    /// does not abort the others.
    pub async fn initialize_known_models(&self) {
        let mut states = self.inner.table.state_changes();
        while self.inner.table.state() == TableState::Init {
            if states.changed().await.is_err() {
                return;
            }
        }
        if self.inner.table.state() != TableState::Ready {
            return;
        }
        info!("initializing all known models");
        for (model_id, kind) in self.inner.table.keys() {
            if kind != EventKind::State {
                continue;
            }
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.materialize(&model_id).await {
                    warn!("failed to initialize model `{model_id}`: {err}");
                }
            });
        }
    }

    /// Disposes a single model: watch registration and comm are torn down.
    pub fn dispose_model(&self, model_id: &str) {
        if let Some(model) = self.inner.registry.remove(model_id) {
            if let Some(comm) = model.comm() {
                comm.close();
            }
        }
        lock(&self.inner.watching).remove(model_id);
    }

    /// Disposes every model. Pending creations fail on their own once the
    /// table reports closed.
    pub fn close(&self) {
        for model in self.inner.registry.clear() {
            if let Some(comm) = model.comm() {
                comm.close();
            }
        }
        lock(&self.inner.watching).clear();
        info!("sync engine closed");
    }

    async fn materialize(&self, model_id: &str) -> Result<(), SyncError> {
        self.get_model(model_id).await?;
        // buffers may already be present at load time; splice them in
        // without waiting for a buffers event
        self.buffers_change(model_id).await
    }

    async fn state_change(&self, model_id: &str) -> Result<(), SyncError> {
        let Some(record) = self.inner.table.get(model_id) else {
            return Ok(());
        };
        self.update_model(model_id, record).await
    }

    /// A `value` event is how every delta arrives: from the backend, from
    /// another client, or as the echo of this engine's own write. The
    /// sequencer decides which of those it is.
    async fn value_change(&self, model_id: &str) -> Result<(), SyncError> {
        let Some(record) = self.inner.table.get_value(model_id) else {
            return Ok(());
        };
        let verdict = lock(&self.inner.sequencer).observe_remote(&record);
        match verdict {
            RemoteVerdict::Stale { republish } => {
                if let Some(tracked) = republish {
                    debug!(
                        "lagging duplicate for model `{model_id}`; re-publishing tracked record"
                    );
                    self.inner.table.set_value(model_id, tracked, true).await?;
                    self.inner.table.save().await?;
                }
                Ok(())
            }
            RemoteVerdict::Apply => self.update_model(model_id, record).await,
        }
    }

    /// Which buffers changed is not tracked, so every buffer-bearing key is
    /// re-derived against the current deserialized state and re-serialized
    /// through its key's serializer.
    async fn buffers_change(&self, model_id: &str) -> Result<(), SyncError> {
        let model = self.get_model(model_id).await?;
        let bundle = self.inner.table.get_buffers(model_id);
        if bundle.is_empty() {
            return Ok(());
        }

        let mut snapshot = model.state();
        merge_buffers(&mut snapshot, &bundle.buffer_paths, &bundle.buffers);

        let schema = model.schema();
        let mut change: StateMap<ModelHandle> = StateMap::new();
        for path in &bundle.buffer_paths {
            let Some(PathSegment::Key(key)) = path.first() else {
                continue;
            };
            let Some(value) = snapshot.get(key) else {
                continue;
            };
            let value = match schema.serializer(key) {
                Some(serializer) => serializer.serialize(value).unwrap_or_else(|reason| {
                    warn!("serializer for key `{key}` of model `{model_id}` failed: {reason}");
                    value.clone()
                }),
                None => value.clone(),
            };
            change.insert(key.clone(), value);
        }
        model.apply_update(change);
        Ok(())
    }

    async fn message_change(&self, model_id: &str) -> Result<(), SyncError> {
        let Some(message) = self.inner.table.get_message(model_id) else {
            return Ok(());
        };
        if payload_is_empty(&message) {
            // reserved for future delete semantics
            return Ok(());
        }
        let Some(model) = self.inner.registry.try_get(model_id) else {
            debug!("custom message for model `{model_id}` arrived before the model; dropping");
            return Ok(());
        };
        model.deliver_custom_message(message);
        Ok(())
    }

    /// The remote-to-model pipeline shared by `state` and accepted `value`
    /// events.
    async fn update_model(&self, model_id: &str, record: ChangeRecord) -> Result<(), SyncError> {
        let model = self.get_model(model_id).await?;
        if record.last_changed.is_some() {
            lock(&self.inner.sequencer).record_observed(&record);
        }
        let Some(resolved) = dereference_links(&record.changed, &self.inner.registry) else {
            warn!(
                "update for model `{model_id}` references models not yet known; dropping this update"
            );
            return Ok(());
        };
        self.inner.registry.finish_update(&model, resolved)
    }

    async fn publish_local_change(&self, change: LocalChange) -> Result<(), SyncError> {
        let LocalChange { model_id, changed } = change;
        let Some(model) = self.inner.registry.try_get(&model_id) else {
            debug!("dropping local change for disposed model `{model_id}`");
            return Ok(());
        };

        let schema = model.schema();
        let mut wire: StateMap<ModelId> = StateMap::new();
        for (key, value) in changed {
            if schema.is_transient(&key) {
                continue;
            }
            let value = match schema.serializer(&key) {
                Some(serializer) => serializer.serialize(&value).unwrap_or_else(|reason| {
                    warn!("serializer for key `{key}` of model `{model_id}` failed: {reason}");
                    value.clone()
                }),
                None => value,
            };
            // resolved handles flatten back to their ids on the wire
            let Some(value) =
                value.resolve(&mut |handle: &ModelHandle| Some(handle.model_id().clone()))
            else {
                continue;
            };
            wire.insert(key, value);
        }
        if wire.is_empty() {
            return Ok(());
        }

        // stamping happens before the await, so the relative order of this
        // engine's own writes is the order they were produced in
        let record = lock(&self.inner.sequencer).stamp_local(&model_id, wire);
        self.inner.table.set_value(&model_id, record, false).await?;
        self.inner.table.save().await?;
        Ok(())
    }

    async fn watch_model(&self, model: &Arc<Model>) {
        let model_id = model.model_id().clone();
        {
            // flag first: two concurrent watch calls must not both open
            let mut watching = lock(&self.inner.watching);
            if watching.contains(&model_id) {
                return;
            }
            watching.insert(model_id.clone());
        }
        lock(&self.inner.sequencer).init_model(&model_id);
        match CommChannel::open(
            model_id.clone(),
            WIDGET_COMM_TARGET.to_string(),
            self.inner.sender.clone(),
            None,
            Vec::new(),
        )
        .await
        {
            Ok(comm) => model.attach_comm(comm),
            Err(err) => warn!("{err}"),
        }
    }
}

fn payload_is_empty(payload: &JsonValue) -> bool {
    match payload {
        JsonValue::Null => true,
        JsonValue::Object(fields) => fields.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::String(s) => s.is_empty(),
        _ => false,
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
