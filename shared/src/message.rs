use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::types::CommId;

/// One custom (non-state) message bound for the compute authority.
#[derive(Debug, Clone)]
pub struct CommMessage {
    pub comm_id: CommId,
    pub target_name: String,
    pub data: JsonValue,
    pub buffers: Vec<Bytes>,
}

/// Errors from the backend message transport.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// The transport could not accept the message. Delivery is
    /// fire-and-forget, so this is the only failure it reports.
    #[error("backend unreachable: {reason}")]
    Unreachable { reason: String },
}

/// External collaborator that forwards custom messages to the authoritative
/// backend process. No delivery guarantee beyond the transport's own.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_custom_message(&self, message: CommMessage) -> Result<(), SendError>;
}
