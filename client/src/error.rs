use thiserror::Error;

use widgetsync_shared::{ModelId, TableError};

/// Errors surfaced by the synchronization engine.
///
/// Recoverable conditions (an unresolved reference, a stale duplicate
/// write) are handled inside the engine and logged; they never appear
/// here. Everything that does is scoped to a single model; no failure in
/// this crate is fatal to the process.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The owning session closed while a model creation was waiting on
    /// upstream data. Callers must not retry.
    #[error("session closed while waiting for model `{model_id}`")]
    SessionClosed { model_id: ModelId },

    /// A per-key serializer rejected an incoming value. Only the single
    /// update is aborted; the model keeps its last good state.
    #[error("failed to deserialize key `{key}` of model `{model_id}`: {reason}")]
    Deserialize {
        model_id: ModelId,
        key: String,
        reason: String,
    },

    /// Watch registration partially failed: the comm channel could not be
    /// opened. The watched flag stays set so the open is not retried on
    /// every event; the channel is absent until the next explicit watch.
    #[error("comm channel open failed for model `{model_id}`: {reason}")]
    ChannelOpen { model_id: ModelId, reason: String },

    /// The shared table rejected a read or write.
    #[error(transparent)]
    Table(#[from] TableError),
}
