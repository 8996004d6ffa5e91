//! Chunked file transfer over dedicated data channels.
//!
//! The sender opens one channel per connected peer, labelled
//! `<peer id><item id>`. Once the receiver reports `connected`, every chunk
//! is pushed as a `sending` message and acknowledged with `received`. When
//! every index has been acknowledged the sender announces `completed` and
//! both sides close the channel after a short grace period.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use skyway_shared::constants::{CHUNK_SIZE, MAX_DATA_MESSAGE_SIZE, MAX_TRANSFER_CHUNKS};
use skyway_shared::data_message::{self, DataMessage, FileInfo, TransferInfo};
use skyway_shared::error::TransferError;
use skyway_shared::events::{Event, ReceivedItem, TransferStatus};
use skyway_shared::types::PeerId;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Connecting,
    Sending,
    Completed,
}

/// Outgoing transfer state for one channel
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub info: TransferInfo,
    pub chunks: Arc<[Bytes]>,
    pub status: RecordStatus,
    pub acked: BTreeSet<usize>,
    pub peer: PeerId,
}

impl TransferRecord {
    pub fn is_complete(&self) -> bool {
        self.acked.len() == self.chunks.len()
    }
}

/// Incoming chunks of one item, indexed by chunk id
#[derive(Debug)]
struct Assembly {
    peer: PeerId,
    item_id: String,
    chunks: Vec<Option<Bytes>>,
}

/// Side effects requested by the manager, applied by the signaling machine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferAction {
    CreateChannel { peer: PeerId, label: String },
    Send { peer: PeerId, label: String, text: String },
    CloseChannel { peer: PeerId, label: String },
    Emit(Event),
}

/// Split `data` into [`CHUNK_SIZE`] slices, the remainder last.
pub fn chunk_file(data: &Bytes, size: usize) -> Vec<Bytes> {
    let size = size.min(data.len());
    (0..size)
        .step_by(CHUNK_SIZE)
        .map(|start| data.slice(start..(start + CHUNK_SIZE).min(size)))
        .collect()
}

/// `<local id><UTC timestamp with microseconds>`
pub fn item_id(local: &PeerId, now: DateTime<Utc>) -> String {
    format!("{}{}", local, now.format("%Y%m%dT%H%M%S%6fZ"))
}

fn expected_chunks(size: u64) -> usize {
    usize::try_from(size).map_or(usize::MAX, |s| s.div_ceil(CHUNK_SIZE))
}

#[derive(Debug, Default)]
pub struct TransferManager {
    /// Outgoing transfers by channel label
    records: HashMap<String, TransferRecord>,
    /// Channel label to remote peer, for every open transfer channel
    routes: HashMap<String, PeerId>,
    /// Incoming transfers by channel label
    assembly: HashMap<String, Assembly>,
}

impl TransferManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, label: &str) -> Option<&TransferRecord> {
        self.records.get(label)
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &TransferRecord)> {
        self.records.iter()
    }

    /// Number of incoming items still being assembled
    pub fn pending_items(&self) -> usize {
        self.assembly.len()
    }

    pub fn peer_for(&self, label: &str) -> Option<&PeerId> {
        self.routes.get(label)
    }

    /// Start sending `data` to every peer in `peers`. Returns the item id
    /// together with the actions to apply.
    pub fn send_file(
        &mut self,
        local: &PeerId,
        file: FileInfo,
        data: Bytes,
        peers: &[PeerId],
        now: DateTime<Utc>,
    ) -> Result<(String, Vec<TransferAction>), TransferError> {
        if peers.is_empty() {
            info!("No peers in the room, dropping file transfer");
            self.records.clear();
            return Err(TransferError::NoPeers);
        }
        if expected_chunks(file.size) > MAX_TRANSFER_CHUNKS {
            return Err(TransferError::TooLarge(file.size));
        }

        let item_id = item_id(local, now);
        let info = file.with_item_id(item_id.clone());
        let chunks: Arc<[Bytes]> = chunk_file(&data, info.size as usize).into();
        let mut actions = Vec::with_capacity(peers.len() + 1);

        for peer in peers {
            let label = format!("{peer}{item_id}");
            debug!(peer = %peer.short(), channel = %label, chunks = chunks.len(), "Opening transfer channel");
            self.records.insert(
                label.clone(),
                TransferRecord {
                    info: info.clone(),
                    chunks: Arc::clone(&chunks),
                    status: RecordStatus::Connecting,
                    acked: BTreeSet::new(),
                    peer: peer.clone(),
                },
            );
            self.routes.insert(label.clone(), peer.clone());
            actions.push(TransferAction::CreateChannel {
                peer: peer.clone(),
                label,
            });
        }

        actions.push(TransferAction::Emit(Event::ReceivedData {
            item: ReceivedItem {
                info,
                data,
                sender: local.clone(),
            },
            self_id: local.clone(),
        }));

        Ok((item_id, actions))
    }

    pub fn channel_open(&mut self, peer: &PeerId, label: &str, remote: bool) -> Vec<TransferAction> {
        self.routes.insert(label.to_string(), peer.clone());
        if !remote {
            return Vec::new();
        }
        self.send(peer, label, &DataMessage::Connected {
            channel: label.to_string(),
        })
        .into_iter()
        .collect()
    }

    /// Handle one text message received on channel `label`. The channel the
    /// message names is only informational; state is keyed by `label`.
    pub fn handle_message(
        &mut self,
        local: &PeerId,
        peer: &PeerId,
        label: &str,
        text: &str,
    ) -> Vec<TransferAction> {
        let message = match data_message::decode(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(channel = %label, error = %e, "Dropping malformed data channel message");
                return Vec::new();
            }
        };
        if message.channel() != label {
            debug!(channel = %label, claimed = %message.channel(), "Message names another channel");
        }

        match message {
            DataMessage::Connected { .. } => self.on_connected(local, peer, label),
            DataMessage::Sending {
                sender,
                item_id,
                chunk_id,
                chunk,
                ..
            } => self.on_chunk(local, peer, label, sender, item_id, chunk_id, &chunk),
            DataMessage::Received {
                sender,
                receiver,
                item_id,
                chunk_id,
                ..
            } => self.on_ack(
                peer,
                TransferStatus {
                    channel: label.to_string(),
                    item_id,
                    sender,
                    receiver,
                },
                chunk_id,
            ),
            DataMessage::Completed {
                name,
                size,
                item_type,
                item_id,
                sender,
                ..
            } => self.on_completed(
                local,
                peer,
                label,
                TransferInfo {
                    name,
                    size,
                    item_type,
                    item_id,
                },
                sender,
            ),
        }
    }

    fn on_connected(&mut self, local: &PeerId, peer: &PeerId, label: &str) -> Vec<TransferAction> {
        let Some(record) = self.records.get_mut(label) else {
            debug!(channel = %label, "Data channel has been initialised");
            return Vec::new();
        };
        if record.status != RecordStatus::Connecting {
            return Vec::new();
        }

        if record.chunks.is_empty() {
            let status = TransferStatus {
                channel: label.to_string(),
                item_id: record.info.item_id.clone(),
                sender: local.clone(),
                receiver: peer.clone(),
            };
            return self.complete(peer, status);
        }

        let record_chunks = Arc::clone(&record.chunks);
        let item_id = record.info.item_id.clone();
        record.status = RecordStatus::Sending;

        let mut actions = Vec::with_capacity(record_chunks.len());
        for (index, chunk) in record_chunks.iter().enumerate() {
            let message =
                DataMessage::sending(local.clone(), label.to_string(), item_id.clone(), index, chunk);
            actions.extend(self.send(peer, label, &message));
        }
        debug!(channel = %label, chunks = record_chunks.len(), "Pushed all chunks");
        actions
    }

    #[allow(clippy::too_many_arguments)]
    fn on_chunk(
        &mut self,
        local: &PeerId,
        peer: &PeerId,
        label: &str,
        sender: PeerId,
        item_id: String,
        chunk_id: usize,
        chunk: &str,
    ) -> Vec<TransferAction> {
        if chunk_id >= MAX_TRANSFER_CHUNKS {
            warn!(channel = %label, chunk = chunk_id, "Dropping chunk beyond the transfer limit");
            return Vec::new();
        }
        let bytes = match data_message::decode_chunk(chunk) {
            Ok(b) => b,
            Err(e) => {
                warn!(channel = %label, chunk = chunk_id, error = %e, "Dropping undecodable chunk");
                return Vec::new();
            }
        };

        let assembly = self.assembly.entry(label.to_string()).or_insert_with(|| Assembly {
            peer: peer.clone(),
            item_id: item_id.clone(),
            chunks: Vec::new(),
        });
        if assembly.item_id != item_id {
            warn!(channel = %label, item = %item_id, "Dropping chunk of another item");
            return Vec::new();
        }
        if assembly.chunks.len() <= chunk_id {
            assembly.chunks.resize(chunk_id + 1, None);
        }
        assembly.chunks[chunk_id] = Some(bytes);

        let ack = DataMessage::Received {
            sender,
            receiver: local.clone(),
            item_id,
            channel: label.to_string(),
            chunk_id,
        };
        self.send(peer, label, &ack).into_iter().collect()
    }

    fn on_ack(&mut self, peer: &PeerId, status: TransferStatus, chunk_id: usize) -> Vec<TransferAction> {
        let Some(record) = self.records.get_mut(&status.channel) else {
            debug!(channel = %status.channel, "Acknowledgement for unknown transfer");
            return Vec::new();
        };
        if record.status == RecordStatus::Completed || chunk_id >= record.chunks.len() {
            return Vec::new();
        }

        record.acked.insert(chunk_id);
        debug!(
            channel = %status.channel,
            acked = record.acked.len(),
            total = record.chunks.len(),
            "Upload progress"
        );

        if record.is_complete() {
            self.complete(peer, status)
        } else {
            Vec::new()
        }
    }

    fn complete(&mut self, peer: &PeerId, status: TransferStatus) -> Vec<TransferAction> {
        let Some(record) = self.records.get_mut(&status.channel) else {
            return Vec::new();
        };
        record.status = RecordStatus::Completed;
        let info = record.info.clone();

        info!(channel = %status.channel, item = %info.item_id, "Transfer completed");

        let label = status.channel.clone();
        let completed = DataMessage::completed(
            &info,
            status.sender.clone(),
            status.receiver.clone(),
            label.clone(),
        );

        let mut actions = vec![TransferAction::Emit(Event::ReceivedDataStatus(status))];
        actions.extend(self.send(peer, &label, &completed));
        actions.push(TransferAction::CloseChannel {
            peer: peer.clone(),
            label,
        });
        actions
    }

    fn on_completed(
        &mut self,
        local: &PeerId,
        peer: &PeerId,
        label: &str,
        info: TransferInfo,
        sender: PeerId,
    ) -> Vec<TransferAction> {
        let chunks = self
            .assembly
            .remove(label)
            .filter(|a| a.item_id == info.item_id)
            .map(|a| a.chunks)
            .unwrap_or_default();
        let close = TransferAction::CloseChannel {
            peer: peer.clone(),
            label: label.to_string(),
        };

        let expected = expected_chunks(info.size).min(MAX_TRANSFER_CHUNKS);
        let hole = (0..expected.max(chunks.len())).find(|&i| chunks.get(i).map_or(true, Option::is_none));
        if let Some(index) = hole {
            let err = TransferError::Stalled {
                item_id: info.item_id.clone(),
                index,
            };
            return vec![self.transfer_failed(label, err), close];
        }

        let mut data = BytesMut::with_capacity(chunks.iter().flatten().map(Bytes::len).sum());
        for chunk in chunks.into_iter().flatten() {
            data.extend_from_slice(&chunk);
        }
        if data.len() as u64 != info.size {
            let err = TransferError::SizeMismatch {
                item_id: info.item_id.clone(),
                expected: info.size,
                actual: data.len() as u64,
            };
            return vec![self.transfer_failed(label, err), close];
        }

        info!(channel = %label, item = %info.item_id, bytes = data.len(), "Received file");
        vec![
            TransferAction::Emit(Event::ReceivedData {
                item: ReceivedItem {
                    info,
                    data: data.freeze(),
                    sender,
                },
                self_id: local.clone(),
            }),
            close,
        ]
    }

    fn transfer_failed(&self, label: &str, err: TransferError) -> TransferAction {
        warn!(channel = %label, error = %err, "Discarding incomplete transfer");
        TransferAction::Emit(Event::DataChannelError {
            channel: label.to_string(),
            reason: err.to_string(),
        })
    }

    /// A channel went away. Its transfer state is released; unfinished
    /// transfers on it are stalled.
    pub fn channel_closed(&mut self, label: &str) {
        self.routes.remove(label);
        if let Some(record) = self.records.remove(label) {
            if record.status != RecordStatus::Completed {
                let err = TransferError::ChannelClosed(label.to_string());
                warn!(error = %err, acked = record.acked.len(), total = record.chunks.len(), "Transfer stalled");
            }
        }
        if let Some(assembly) = self.assembly.remove(label) {
            let err = TransferError::ChannelClosed(label.to_string());
            warn!(error = %err, item = %assembly.item_id, "Incoming transfer stalled");
        }
    }

    pub fn channel_error(&mut self, label: &str, reason: &str) -> Vec<TransferAction> {
        warn!(channel = %label, reason, "Data channel error");
        vec![TransferAction::Emit(Event::DataChannelError {
            channel: label.to_string(),
            reason: reason.to_string(),
        })]
    }

    /// Drop every route, outgoing record and incoming item that involves
    /// `peer`.
    pub fn forget_peer(&mut self, peer: &PeerId) {
        self.routes.retain(|_, p| p != peer);
        self.records.retain(|_, r| &r.peer != peer);
        self.assembly.retain(|_, a| &a.peer != peer);
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.routes.clear();
        self.assembly.clear();
    }

    fn send(&self, peer: &PeerId, label: &str, message: &DataMessage) -> Option<TransferAction> {
        match data_message::encode(message) {
            Ok(text) if text.len() > MAX_DATA_MESSAGE_SIZE => {
                warn!(channel = %label, len = text.len(), "Data channel message too large, dropped");
                None
            }
            Ok(text) => Some(TransferAction::Send {
                peer: peer.clone(),
                label: label.to_string(),
                text,
            }),
            Err(e) => {
                warn!(channel = %label, error = %e, "Failed to encode data channel message");
                None
            }
        }
    }
}
