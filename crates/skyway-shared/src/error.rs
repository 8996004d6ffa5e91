use thiserror::Error;

use crate::types::PeerId;

#[derive(Error, Debug)]
pub enum SkywayError {
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Media access error: {0}")]
    MediaAccess(#[from] MediaAccessError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// Failure to obtain credentials and signaling configuration.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Invalid bootstrap response: {0}")]
    InvalidResponse(String),

    #[error("Invalid constraints in bootstrap response: {0}")]
    InvalidConstraints(#[from] serde_json::Error),
}

/// A payload that could not be decoded. The message is dropped and the
/// session continues.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed base64 chunk: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Offer/answer creation or description failure. Abandons the handshake for
/// one peer only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Failed to create peer connection: {0}")]
    PeerConnection(String),

    #[error("Failed to create offer: {0}")]
    CreateOffer(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswer(String),

    #[error("Failed to set local description: {0}")]
    SetLocalDescription(String),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescription(String),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidate(String),

    #[error("Data channel error: {0}")]
    DataChannel(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),
}

impl NegotiationError {
    /// Whether the offer/answer exchange with the peer can no longer finish.
    /// Candidate and data channel failures leave the handshake intact.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::AddIceCandidate(_) | Self::DataChannel(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("Access to local media was denied")]
    Denied,

    #[error("Local media unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("No connected peers to send to")]
    NoPeers,

    #[error("Not inside a room")]
    NotInRoom,

    #[error("Data channel {0} closed before the transfer completed")]
    ChannelClosed(String),

    #[error("Transfer {item_id} is missing chunk {index}")]
    Stalled { item_id: String, index: usize },

    #[error("Transfer {item_id} carried {actual} bytes, {expected} announced")]
    SizeMismatch {
        item_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("File of {0} bytes exceeds the transfer limit")]
    TooLarge(u64),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),
}
