use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use widgetsync_shared::{CommId, CommMessage, MessageSender, SendError};

use crate::error::SyncError;

/// Virtual duplex channel between one model and the compute authority.
///
/// Outbound messages ride the external message-send collaborator. Inbound
/// custom messages do NOT arrive through this channel: they are delivered
/// by `message` table events straight to the model's own handler, so the
/// inbound stream here terminates immediately. Channel identity is
/// transient; `close` has nothing to tear down locally.
#[derive(Clone)]
pub struct CommChannel {
    comm_id: CommId,
    target_name: String,
    sender: Arc<dyn MessageSender>,
}

impl CommChannel {
    pub(crate) async fn open(
        comm_id: CommId,
        target_name: String,
        sender: Arc<dyn MessageSender>,
        data: Option<JsonValue>,
        buffers: Vec<Bytes>,
    ) -> Result<Self, SyncError> {
        let channel = Self {
            comm_id,
            target_name,
            sender,
        };
        if data.is_some() || !buffers.is_empty() {
            channel
                .send(data.unwrap_or(JsonValue::Null), buffers)
                .await
                .map_err(|err| SyncError::ChannelOpen {
                    model_id: channel.comm_id.clone(),
                    reason: err.to_string(),
                })?;
        }
        Ok(channel)
    }

    pub fn comm_id(&self) -> &CommId {
        &self.comm_id
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub async fn send(&self, data: JsonValue, buffers: Vec<Bytes>) -> Result<(), SendError> {
        self.sender
            .send_custom_message(CommMessage {
                comm_id: self.comm_id.clone(),
                target_name: self.target_name.clone(),
                data,
                buffers,
            })
            .await
    }

    pub fn close(&self) {
        debug!("comm channel `{}` closed", self.comm_id);
    }

    /// Inbound message stream. Terminates immediately; see the type docs.
    pub fn messages(&self) -> mpsc::UnboundedReceiver<JsonValue> {
        let (_tx, rx) = mpsc::unbounded_channel();
        rx
    }
}

impl fmt::Debug for CommChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommChannel")
            .field("comm_id", &self.comm_id)
            .field("target_name", &self.target_name)
            .finish()
    }
}
