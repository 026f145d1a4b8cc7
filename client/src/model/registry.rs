use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};

use widgetsync_shared::{
    merge_present_buffers, ChangeRecord, ModelId, SharedTable, StateMap, TableState, Value,
};

use crate::error::SyncError;
use crate::model::schema::SchemaRegistry;
use crate::model::{LocalChange, Model, ModelHandle, ModuleInfo};
use crate::sequencer::ChangeSequencer;

/// Key whose present-but-null value breaks the downstream rendering
/// contract and is normalized to an empty sequence instead.
const OUTPUTS_KEY: &str = "outputs";

/// Owns the set of live model proxies for one session.
///
/// Creation is lazy and idempotent per id: concurrent callers share one
/// in-flight creation, and a creation suspends until the table is ready and
/// holds state for the id. A freshly created model is inserted into the
/// pool *before* its initial state is applied, so models that reference
/// each other (in any order, even cyclically) resolve instead of
/// deadlocking.
pub struct ModelRegistry {
    table: Arc<dyn SharedTable>,
    schemas: SchemaRegistry,
    sequencer: Arc<StdMutex<ChangeSequencer>>,
    outbound: mpsc::Sender<LocalChange>,
    created_tx: mpsc::UnboundedSender<Arc<Model>>,
    models: StdMutex<HashMap<ModelId, Arc<Model>>>,
    pending: StdMutex<HashMap<ModelId, watch::Receiver<bool>>>,
}

enum Claim {
    Create(watch::Sender<bool>),
    Wait(watch::Receiver<bool>),
}

impl ModelRegistry {
    pub(crate) fn new(
        table: Arc<dyn SharedTable>,
        schemas: SchemaRegistry,
        sequencer: Arc<StdMutex<ChangeSequencer>>,
        outbound: mpsc::Sender<LocalChange>,
        created_tx: mpsc::UnboundedSender<Arc<Model>>,
    ) -> Self {
        Self {
            table,
            schemas,
            sequencer,
            outbound,
            created_tx,
            models: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
        }
    }

    /// Non-suspending lookup. This is what reference resolution uses: it
    /// fails fast when the model is unknown instead of waiting for it.
    pub fn try_get(&self, model_id: &str) -> Option<Arc<Model>> {
        lock(&self.models).get(model_id).cloned()
    }

    pub fn model_ids(&self) -> Vec<ModelId> {
        lock(&self.models).keys().cloned().collect()
    }

    /// Returns the model for `model_id`, creating it if needed. Suspends
    /// until the table is ready and holds state for the id; fails with
    /// [`SyncError::SessionClosed`] if the session closes first. Callers
    /// must not retry after that.
    pub async fn get_or_create(&self, model_id: &str) -> Result<Arc<Model>, SyncError> {
        loop {
            if let Some(model) = self.try_get(model_id) {
                return Ok(model);
            }
            let claim = {
                let mut pending = lock(&self.pending);
                match pending.get(model_id) {
                    Some(done) => Claim::Wait(done.clone()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        pending.insert(model_id.to_string(), rx);
                        Claim::Create(tx)
                    }
                }
            };
            match claim {
                Claim::Create(done) => {
                    let result = self.create(model_id).await;
                    lock(&self.pending).remove(model_id);
                    let _ = done.send(true);
                    return result;
                }
                Claim::Wait(mut done) => {
                    // woken when the in-flight creation finishes either way;
                    // a failed creation sends us back around the loop
                    let _ = done.changed().await;
                }
            }
        }
    }

    async fn create(&self, model_id: &str) -> Result<Arc<Model>, SyncError> {
        let mut table_states = self.table.state_changes();
        loop {
            match self.table.state() {
                TableState::Ready => break,
                TableState::Closed => return Err(self.session_closed(model_id)),
                TableState::Init => {
                    if table_states.changed().await.is_err() {
                        return Err(self.session_closed(model_id));
                    }
                }
            }
        }

        // wait until the table holds state for this id, re-checking on
        // every change notification
        let mut table_changes = self.table.changes();
        let record = loop {
            if let Some(record) = self.table.get(model_id) {
                break record;
            }
            if self.table.state() == TableState::Closed {
                return Err(self.session_closed(model_id));
            }
            debug!("model `{model_id}` not yet known -- waiting");
            tokio::select! {
                changed = table_changes.recv() => match changed {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Err(self.session_closed(model_id)),
                },
                state = table_states.changed() => {
                    if state.is_err()
                        || *table_states.borrow_and_update() == TableState::Closed
                    {
                        return Err(self.session_closed(model_id));
                    }
                }
            }
        };

        let module = ModuleInfo::from_state(&record.changed);
        let schema = self.schemas.resolve(&module);
        let model = Model::new(model_id.to_string(), module, schema, self.outbound.clone());

        // insert before applying the initial state: mutually referencing
        // models must be able to resolve against each other
        lock(&self.models).insert(model_id.to_string(), model.clone());

        if let Err(err) = self.apply_initial(&model, record).await {
            match err {
                SyncError::Deserialize { .. } => {
                    // scoped to this one update; a later event retries it
                    warn!("initial state for model `{model_id}` dropped: {err}");
                }
                err => {
                    lock(&self.models).remove(model_id);
                    return Err(err);
                }
            }
        }

        info!("created model `{model_id}`");
        let _ = self.created_tx.send(model.clone());
        Ok(model)
    }

    async fn apply_initial(
        &self,
        model: &Arc<Model>,
        record: ChangeRecord,
    ) -> Result<(), SyncError> {
        lock(&self.sequencer).record_observed(&record);
        let resolved = self.resolve_suspending(&record.changed).await?;
        self.finish_update(model, resolved)
    }

    /// Creation-time reference resolution. Unlike the fail-fast resolution
    /// used for incremental updates, this one suspends until every
    /// referenced model exists: creation order between a model and its
    /// targets must not matter.
    async fn resolve_suspending(
        &self,
        state: &StateMap<ModelId>,
    ) -> Result<StateMap<ModelHandle>, SyncError> {
        let mut referenced = Vec::new();
        for value in state.values() {
            value.collect_references(&mut referenced);
        }

        let mut handles: HashMap<ModelId, ModelHandle> = HashMap::new();
        for reference in referenced {
            if handles.contains_key(reference) {
                continue;
            }
            let target = self.get_or_create_boxed(reference).await?;
            handles.insert(reference.clone(), target.handle());
        }

        let mut resolved = StateMap::with_capacity(state.len());
        for (key, value) in state {
            match value.resolve(&mut |id: &ModelId| handles.get(id).cloned()) {
                Some(value) => {
                    resolved.insert(key.clone(), value);
                }
                None => warn!("reference under key `{key}` vanished during resolution"),
            }
        }
        Ok(resolved)
    }

    fn get_or_create_boxed<'a>(
        &'a self,
        model_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<Model>, SyncError>> + Send + 'a>> {
        Box::pin(self.get_or_create(model_id))
    }

    /// Tail of every remote-to-model update: splice in the buffers the
    /// table currently holds, run the per-key deserializers, normalize
    /// `outputs`, and hand the result to the model.
    pub(crate) fn finish_update(
        &self,
        model: &Arc<Model>,
        mut state: StateMap<ModelHandle>,
    ) -> Result<(), SyncError> {
        let bundle = self.table.get_buffers(model.model_id());
        merge_present_buffers(&mut state, &bundle);

        let schema = model.schema();
        let mut deserialized = StateMap::with_capacity(state.len());
        for (key, value) in state {
            let value = match schema.serializer(&key) {
                Some(serializer) => {
                    serializer
                        .deserialize(value)
                        .map_err(|reason| SyncError::Deserialize {
                            model_id: model.model_id().clone(),
                            key: key.clone(),
                            reason,
                        })?
                }
                None => value,
            };
            deserialized.insert(key, value);
        }

        normalize_outputs(&mut deserialized);
        model.apply_update(deserialized);
        Ok(())
    }

    pub(crate) fn remove(&self, model_id: &str) -> Option<Arc<Model>> {
        lock(&self.models).remove(model_id)
    }

    pub(crate) fn clear(&self) -> Vec<Arc<Model>> {
        lock(&self.models).drain().map(|(_, model)| model).collect()
    }

    fn session_closed(&self, model_id: &str) -> SyncError {
        SyncError::SessionClosed {
            model_id: model_id.to_string(),
        }
    }
}

/// A present-but-null `outputs` value breaks the downstream rendering
/// contract; it is normalized to an empty sequence before application.
fn normalize_outputs(state: &mut StateMap<ModelHandle>) {
    if let Some(value) = state.get_mut(OUTPUTS_KEY) {
        if value.is_null() {
            *value = Value::Array(Vec::new());
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
