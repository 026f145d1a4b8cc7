//! # Widgetsync Client
//! Per-session synchronization engine that keeps a pool of widget models
//! consistent with the backend through the shared table.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod comm;
mod dereference;
mod engine;
mod error;
mod model;
mod sequencer;

pub use comm::CommChannel;
pub use dereference::dereference_links;
pub use engine::SyncEngine;
pub use error::SyncError;
pub use model::{
    registry::ModelRegistry,
    schema::{KeySerializer, ModelSchema, SchemaRegistry},
    LocalChange, Model, ModelHandle, ModuleInfo,
};
pub use sequencer::{ChangeSequencer, RemoteVerdict};

pub use widgetsync_shared::{
    merge_buffers, merge_present_buffers, state_from_json, state_to_json, BufferBundle,
    BufferPath, ChangeRecord, CommId, CommMessage, EventKind, MemoryTable, MessageSender,
    ModelId, PathSegment, SendError, SequenceNumber, SharedTable, StateMap, TableError, TableKey,
    TableState, Value, REFERENCE_MAX_DEPTH, REFERENCE_PREFIX,
};
