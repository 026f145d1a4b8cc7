//! # Widgetsync Shared
//! Data model and shared-table boundary common to widgetsync clients and the
//! backend process.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod buffers;
mod memory;
mod message;
mod record;
mod table;
mod types;
mod value;

pub use buffers::{merge_buffers, merge_present_buffers, BufferBundle, BufferPath, PathSegment};
pub use memory::MemoryTable;
pub use message::{CommMessage, MessageSender, SendError};
pub use record::ChangeRecord;
pub use table::{EventKind, SharedTable, TableError, TableKey, TableState};
pub use types::{CommId, ModelId, SequenceNumber};
pub use value::{
    state_from_json, state_to_json, StateMap, Value, REFERENCE_MAX_DEPTH, REFERENCE_PREFIX,
};
