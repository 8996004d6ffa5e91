//! Peer connection primitives as seen by the signaling machine.
//!
//! A backend receives [`PeerOp`]s through [`PeerConnection::execute`] and
//! reports completions and notifications back as [`PeerSignal`]s, tagged with
//! the [`ConnectionId`] they belong to. Ops for one connection must be applied
//! in submission order.

use std::time::Duration;

use serde_json::Value;
use skyway_shared::error::NegotiationError;
use skyway_shared::ice::IceConfig;
use skyway_shared::session::MediaConstraints;
use skyway_shared::types::{
    CandidateGenerationState, ConnectionId, IceCandidate, IceConnectionState, LocalStream, PeerId,
    RemoteStream, SdpType, SessionDescription, SignalingState,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PeerOp {
    CreateOffer { constraints: MediaConstraints },
    CreateAnswer { constraints: MediaConstraints },
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    AddStream(LocalStream),
    CreateDataChannel { label: String },
    SendData { label: String, text: String },
    /// Close a data channel once `after` has elapsed
    CloseDataChannel { label: String, after: Duration },
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
    LocalDescriptionSet(SessionDescription),
    RemoteDescriptionSet(SdpType),
    Failed(NegotiationError),
    /// A gathered local candidate, `None` once gathering has finished
    LocalCandidate(Option<IceCandidate>),
    IceConnectionState(IceConnectionState),
    IceGatheringState(CandidateGenerationState),
    SignalingState(SignalingState),
    RemoteStream(RemoteStream),
    DataChannelOpen { label: String, remote: bool },
    DataChannelMessage { label: String, text: String },
    DataChannelClosed { label: String },
    DataChannelError { label: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerSignal {
    pub peer: PeerId,
    pub connection: ConnectionId,
    pub event: PeerEvent,
}

impl PeerSignal {
    pub fn new(peer: PeerId, connection: ConnectionId, event: PeerEvent) -> Self {
        Self {
            peer,
            connection,
            event,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    pub ice: IceConfig,
    pub pc_constraints: Value,
}

pub trait PeerConnection: Send {
    /// Queue an operation. Failures are reported asynchronously as
    /// [`PeerEvent::Failed`].
    fn execute(&self, op: PeerOp);
}

pub trait PeerConnector {
    type Connection: PeerConnection;

    fn open(
        &mut self,
        peer: &PeerId,
        id: ConnectionId,
        config: &ConnectionConfig,
    ) -> Result<Self::Connection, NegotiationError>;
}
