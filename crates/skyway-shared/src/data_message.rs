use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::PeerId;

/// Metadata of one transferred item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    pub name: String,
    pub size: u64,
    #[serde(rename = "itemType")]
    pub item_type: String,
    #[serde(rename = "itemId")]
    pub item_id: String,
}

/// File description supplied by the application, before an item id exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub item_type: String,
}

impl FileInfo {
    pub fn with_item_id(self, item_id: String) -> TransferInfo {
        TransferInfo {
            name: self.name,
            size: self.size,
            item_type: self.item_type,
            item_id,
        }
    }
}

/// Messages carried over a transfer data channel, tagged by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DataMessage {
    Connected {
        channel: String,
    },
    Sending {
        sender: PeerId,
        channel: String,
        #[serde(rename = "itemId")]
        item_id: String,
        #[serde(rename = "chunkId")]
        chunk_id: usize,
        /// Base64 encoded chunk bytes
        chunk: String,
    },
    Received {
        sender: PeerId,
        receiver: PeerId,
        #[serde(rename = "itemId")]
        item_id: String,
        channel: String,
        #[serde(rename = "chunkId")]
        chunk_id: usize,
    },
    Completed {
        name: String,
        size: u64,
        #[serde(rename = "itemType")]
        item_type: String,
        #[serde(rename = "itemId")]
        item_id: String,
        sender: PeerId,
        receiver: PeerId,
        channel: String,
    },
}

impl DataMessage {
    pub fn sending(
        sender: PeerId,
        channel: String,
        item_id: String,
        chunk_id: usize,
        chunk: &[u8],
    ) -> Self {
        Self::Sending {
            sender,
            channel,
            item_id,
            chunk_id,
            chunk: STANDARD.encode(chunk),
        }
    }

    pub fn completed(info: &TransferInfo, sender: PeerId, receiver: PeerId, channel: String) -> Self {
        Self::Completed {
            name: info.name.clone(),
            size: info.size,
            item_type: info.item_type.clone(),
            item_id: info.item_id.clone(),
            sender,
            receiver,
            channel,
        }
    }

    /// The channel label the message refers to
    pub fn channel(&self) -> &str {
        match self {
            Self::Connected { channel }
            | Self::Sending { channel, .. }
            | Self::Received { channel, .. }
            | Self::Completed { channel, .. } => channel,
        }
    }
}

pub fn encode(message: &DataMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode(text: &str) -> Result<DataMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

pub fn decode_chunk(chunk: &str) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(STANDARD.decode(chunk)?))
}
