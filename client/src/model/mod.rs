use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::{debug, warn};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use widgetsync_shared::{ModelId, StateMap, Value};

use crate::comm::CommChannel;
use crate::model::schema::ModelSchema;

pub mod registry;
pub mod schema;

/// Reserved state keys identifying the rendering implementation of a model.
pub(crate) const MODEL_NAME_KEY: &str = "_model_name";
pub(crate) const MODEL_MODULE_KEY: &str = "_model_module";
pub(crate) const MODULE_VERSION_KEY: &str = "_model_module_version";

/// Identity of the rendering implementation behind a model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ModuleInfo {
    pub model_name: String,
    pub model_module: String,
    pub module_version: String,
}

impl ModuleInfo {
    pub(crate) fn from_state(state: &StateMap<ModelId>) -> Self {
        let field = |key: &str| {
            state
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            model_name: field(MODEL_NAME_KEY),
            model_module: field(MODEL_MODULE_KEY),
            module_version: field(MODULE_VERSION_KEY),
        }
    }
}

/// One locally produced state delta, emitted by a model into the engine's
/// publish queue. The engine strips transients, serializes, stamps a
/// sequence number and writes the result to the shared table.
#[derive(Clone)]
pub struct LocalChange {
    pub model_id: ModelId,
    pub changed: StateMap<ModelHandle>,
}

/// A resolved reference to another model: the id plus a weak handle.
/// Models only ever reference each other weakly, so disposal of the owning
/// registry releases every model no matter how they point at one another.
#[derive(Clone)]
pub struct ModelHandle {
    model_id: ModelId,
    model: Weak<Model>,
}

impl ModelHandle {
    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    pub fn upgrade(&self) -> Option<Arc<Model>> {
        self.model.upgrade()
    }
}

impl PartialEq for ModelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.model_id == other.model_id
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModelHandle").field(&self.model_id).finish()
    }
}

/// One synchronized widget's state container.
///
/// A model is mutated from exactly two directions: the engine applying a
/// remote update (`apply_update`, silent), and a local writer such as the
/// renderer (`set`, which also queues the delta for publication). Remote
/// applications can therefore never re-enter the publish path.
pub struct Model {
    model_id: ModelId,
    module: ModuleInfo,
    schema: Arc<ModelSchema>,
    state: Mutex<StateMap<ModelHandle>>,
    outbound: mpsc::Sender<LocalChange>,
    comm: Mutex<Option<CommChannel>>,
    custom_tx: Mutex<Option<mpsc::UnboundedSender<JsonValue>>>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Model").field(&self.model_id).finish()
    }
}

impl Model {
    pub(crate) fn new(
        model_id: ModelId,
        module: ModuleInfo,
        schema: Arc<ModelSchema>,
        outbound: mpsc::Sender<LocalChange>,
    ) -> Arc<Self> {
        Arc::new(Self {
            model_id,
            module,
            schema,
            state: Mutex::new(StateMap::new()),
            outbound,
            comm: Mutex::new(None),
            custom_tx: Mutex::new(None),
        })
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    pub fn module(&self) -> &ModuleInfo {
        &self.module
    }

    pub(crate) fn schema(&self) -> Arc<ModelSchema> {
        self.schema.clone()
    }

    pub fn handle(self: &Arc<Self>) -> ModelHandle {
        ModelHandle {
            model_id: self.model_id.clone(),
            model: Arc::downgrade(self),
        }
    }

    /// Snapshot of the current resolved state.
    pub fn state(&self) -> StateMap<ModelHandle> {
        lock(&self.state).clone()
    }

    pub fn get(&self, key: &str) -> Option<Value<ModelHandle>> {
        lock(&self.state).get(key).cloned()
    }

    /// Applies a local mutation and queues it for publication to the shared
    /// table. Suspends while the publish queue is full, which is what keeps
    /// local writes ordered and bounded.
    pub async fn set(&self, changed: StateMap<ModelHandle>) {
        {
            let mut state = lock(&self.state);
            for (key, value) in &changed {
                state.insert(key.clone(), value.clone());
            }
        }
        let change = LocalChange {
            model_id: self.model_id.clone(),
            changed,
        };
        if self.outbound.send(change).await.is_err() {
            warn!(
                "local change to model `{}` dropped: engine is gone",
                self.model_id
            );
        }
    }

    /// Applies a remote update without feeding the publish queue.
    pub(crate) fn apply_update(&self, update: StateMap<ModelHandle>) {
        let mut state = lock(&self.state);
        for (key, value) in update {
            state.insert(key, value);
        }
    }

    /// Inbound custom messages, delivered via the table's `message` rows.
    /// Only the latest subscriber receives them.
    pub fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<JsonValue> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.custom_tx) = Some(tx);
        rx
    }

    pub(crate) fn deliver_custom_message(&self, message: JsonValue) {
        let sender = lock(&self.custom_tx);
        match sender.as_ref() {
            Some(tx) if tx.send(message.clone()).is_ok() => {}
            _ => debug!(
                "custom message for model `{}` had no live subscriber",
                self.model_id
            ),
        }
    }

    pub(crate) fn attach_comm(&self, comm: CommChannel) {
        *lock(&self.comm) = Some(comm);
    }

    /// The comm channel attached by watching this model, if the open
    /// succeeded.
    pub fn comm(&self) -> Option<CommChannel> {
        lock(&self.comm).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
