// Peer registry, signaling state machine and data transfers over WebRTC.

pub mod connection;
pub mod registry;
pub mod signaling;
pub mod transfer;
pub mod webrtc_peer;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use connection::{ConnectionConfig, PeerConnection, PeerConnector, PeerEvent, PeerOp, PeerSignal};
pub use registry::{PeerEntry, PeerRegistry};
pub use signaling::{JoinStep, SignalingMachine};
pub use transfer::{TransferAction, TransferManager};
pub use webrtc_peer::{WebRtcConnection, WebRtcConnector};
