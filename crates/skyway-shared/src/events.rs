//! Application event registry.
//!
//! Handlers are registered per [`EventKind`] and invoked synchronously in
//! subscription order. The handler list is copied before an emission starts,
//! so handlers may subscribe or unsubscribe from inside a callback without
//! affecting the emission in progress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde_json::Value;

use crate::data_message::TransferInfo;
use crate::error::NegotiationError;
use crate::protocol::RedirectAction;
use crate::types::{
    CandidateGenerationState, HandshakeStep, IceConnectionState, LocalStream, PeerId, ReadyState,
    RemoteStream, RoomId, SignalingState,
};

pub const EVENT_READY_STATE_CHANGE: &str = "readyStateChange";
pub const EVENT_CHANNEL_OPEN: &str = "channelOpen";
pub const EVENT_CHANNEL_CLOSE: &str = "channelClose";
pub const EVENT_CHANNEL_ERROR: &str = "channelError";
pub const EVENT_JOINED_ROOM: &str = "joinedRoom";
pub const EVENT_HANDSHAKE_PROGRESS: &str = "handshakeProgress";
pub const EVENT_CANDIDATE_GENERATION_STATE: &str = "candidateGenerationState";
pub const EVENT_ICE_CONNECTION_STATE: &str = "iceConnectionState";
pub const EVENT_PEER_CONNECTION_STATE: &str = "peerConnectionState";
pub const EVENT_MEDIA_ACCESS_SUCCESS: &str = "mediaAccessSuccess";
pub const EVENT_MEDIA_ACCESS_ERROR: &str = "mediaAccessError";
pub const EVENT_PEER_JOINED: &str = "peerJoined";
pub const EVENT_PEER_LEFT: &str = "peerLeft";
pub const EVENT_ADD_PEER_STREAM: &str = "addPeerStream";
pub const EVENT_CHAT_MESSAGE: &str = "chatMessage";
pub const EVENT_RECEIVED_DATA: &str = "receivedData";
pub const EVENT_RECEIVED_DATA_STATUS: &str = "receivedDataStatus";
pub const EVENT_REDIRECT: &str = "redirect";
pub const EVENT_NEGOTIATION_ERROR: &str = "negotiationError";
pub const EVENT_DATA_CHANNEL_ERROR: &str = "dataChannelError";

/// A transferred item, delivered on the receiving side or echoed locally
/// on the sending side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedItem {
    pub info: TransferInfo,
    pub data: Bytes,
    pub sender: PeerId,
}

/// Acknowledgement summary for one finished outgoing transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStatus {
    pub channel: String,
    pub item_id: String,
    pub sender: PeerId,
    pub receiver: PeerId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ReadyStateChange(ReadyState),
    ChannelOpen,
    ChannelClose,
    ChannelError(String),
    JoinedRoom(RoomId),
    HandshakeProgress {
        step: HandshakeStep,
        peer: Option<PeerId>,
    },
    CandidateGenerationState {
        state: CandidateGenerationState,
        peer: PeerId,
    },
    IceConnectionState {
        state: IceConnectionState,
        peer: PeerId,
    },
    PeerConnectionState {
        state: SignalingState,
        peer: PeerId,
    },
    MediaAccessSuccess(LocalStream),
    MediaAccessError(String),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    AddPeerStream {
        peer: PeerId,
        stream: RemoteStream,
    },
    ChatMessage {
        message: Value,
        display_name: String,
        is_private: bool,
    },
    ReceivedData {
        item: ReceivedItem,
        self_id: PeerId,
    },
    ReceivedDataStatus(TransferStatus),
    Redirect {
        action: RedirectAction,
        url: Option<String>,
        info: Option<String>,
    },
    NegotiationError {
        peer: PeerId,
        reason: NegotiationError,
    },
    DataChannelError {
        channel: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ReadyStateChange,
    ChannelOpen,
    ChannelClose,
    ChannelError,
    JoinedRoom,
    HandshakeProgress,
    CandidateGenerationState,
    IceConnectionState,
    PeerConnectionState,
    MediaAccessSuccess,
    MediaAccessError,
    PeerJoined,
    PeerLeft,
    AddPeerStream,
    ChatMessage,
    ReceivedData,
    ReceivedDataStatus,
    Redirect,
    NegotiationError,
    DataChannelError,
}

impl EventKind {
    pub const ALL: [EventKind; 20] = [
        Self::ReadyStateChange,
        Self::ChannelOpen,
        Self::ChannelClose,
        Self::ChannelError,
        Self::JoinedRoom,
        Self::HandshakeProgress,
        Self::CandidateGenerationState,
        Self::IceConnectionState,
        Self::PeerConnectionState,
        Self::MediaAccessSuccess,
        Self::MediaAccessError,
        Self::PeerJoined,
        Self::PeerLeft,
        Self::AddPeerStream,
        Self::ChatMessage,
        Self::ReceivedData,
        Self::ReceivedDataStatus,
        Self::Redirect,
        Self::NegotiationError,
        Self::DataChannelError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ReadyStateChange => EVENT_READY_STATE_CHANGE,
            Self::ChannelOpen => EVENT_CHANNEL_OPEN,
            Self::ChannelClose => EVENT_CHANNEL_CLOSE,
            Self::ChannelError => EVENT_CHANNEL_ERROR,
            Self::JoinedRoom => EVENT_JOINED_ROOM,
            Self::HandshakeProgress => EVENT_HANDSHAKE_PROGRESS,
            Self::CandidateGenerationState => EVENT_CANDIDATE_GENERATION_STATE,
            Self::IceConnectionState => EVENT_ICE_CONNECTION_STATE,
            Self::PeerConnectionState => EVENT_PEER_CONNECTION_STATE,
            Self::MediaAccessSuccess => EVENT_MEDIA_ACCESS_SUCCESS,
            Self::MediaAccessError => EVENT_MEDIA_ACCESS_ERROR,
            Self::PeerJoined => EVENT_PEER_JOINED,
            Self::PeerLeft => EVENT_PEER_LEFT,
            Self::AddPeerStream => EVENT_ADD_PEER_STREAM,
            Self::ChatMessage => EVENT_CHAT_MESSAGE,
            Self::ReceivedData => EVENT_RECEIVED_DATA,
            Self::ReceivedDataStatus => EVENT_RECEIVED_DATA_STATUS,
            Self::Redirect => EVENT_REDIRECT,
            Self::NegotiationError => EVENT_NEGOTIATION_ERROR,
            Self::DataChannelError => EVENT_DATA_CHANNEL_ERROR,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ReadyStateChange(_) => EventKind::ReadyStateChange,
            Self::ChannelOpen => EventKind::ChannelOpen,
            Self::ChannelClose => EventKind::ChannelClose,
            Self::ChannelError(_) => EventKind::ChannelError,
            Self::JoinedRoom(_) => EventKind::JoinedRoom,
            Self::HandshakeProgress { .. } => EventKind::HandshakeProgress,
            Self::CandidateGenerationState { .. } => EventKind::CandidateGenerationState,
            Self::IceConnectionState { .. } => EventKind::IceConnectionState,
            Self::PeerConnectionState { .. } => EventKind::PeerConnectionState,
            Self::MediaAccessSuccess(_) => EventKind::MediaAccessSuccess,
            Self::MediaAccessError(_) => EventKind::MediaAccessError,
            Self::PeerJoined(_) => EventKind::PeerJoined,
            Self::PeerLeft(_) => EventKind::PeerLeft,
            Self::AddPeerStream { .. } => EventKind::AddPeerStream,
            Self::ChatMessage { .. } => EventKind::ChatMessage,
            Self::ReceivedData { .. } => EventKind::ReceivedData,
            Self::ReceivedDataStatus(_) => EventKind::ReceivedDataStatus,
            Self::Redirect { .. } => EventKind::Redirect,
            Self::NegotiationError { .. } => EventKind::NegotiationError,
            Self::DataChannelError { .. } => EventKind::DataChannelError,
        }
    }
}

/// Returned by a handler to continue or halt the current emission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Event) -> Flow + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(HandlerId, Handler)>>,
}

/// Cloneable handle to a shared handler registry.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> Flow + Send + Sync + 'static,
    {
        let mut registry = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = HandlerId(registry.next_id);
        registry.next_id += 1;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Subscribe by wire name. Unknown names are ignored.
    pub fn subscribe_named<F>(&self, name: &str, handler: F) -> Option<HandlerId>
    where
        F: Fn(&Event) -> Flow + Send + Sync + 'static,
    {
        match EventKind::from_name(name) {
            Some(kind) => Some(self.subscribe(kind, handler)),
            None => {
                tracing::debug!(event = name, "Ignoring subscription to unknown event");
                None
            }
        }
    }

    /// Remove one handler, or every handler of `kind` when `id` is `None`.
    pub fn unsubscribe(&self, kind: EventKind, id: Option<HandlerId>) {
        let mut registry = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match id {
            Some(id) => {
                if let Some(list) = registry.handlers.get_mut(&kind) {
                    list.retain(|(handler_id, _)| *handler_id != id);
                }
            }
            None => {
                registry.handlers.remove(&kind);
            }
        }
    }

    pub fn emit(&self, event: &Event) {
        let snapshot: Vec<Handler> = {
            let registry = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            match registry.handlers.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };

        for handler in snapshot {
            if handler(event) == Flow::Stop {
                break;
            }
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        let registry = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        registry.handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventBus")
            .field("kinds", &registry.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_handlers_run_in_order_until_stop() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for (i, flow) in [(1, Flow::Continue), (2, Flow::Stop), (3, Flow::Continue)] {
            let calls = calls.clone();
            bus.subscribe(EventKind::PeerJoined, move |_| {
                calls.lock().unwrap().push(i);
                flow
            });
        }

        bus.emit(&Event::PeerJoined("bob".into()));
        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_unsubscribe_during_emit() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let inner_bus = bus.clone();
        bus.subscribe(EventKind::PeerLeft, move |_| {
            inner_bus.unsubscribe(EventKind::PeerLeft, None);
            Flow::Continue
        });
        let counter = hits.clone();
        bus.subscribe(EventKind::PeerLeft, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Flow::Continue
        });

        // The snapshot still includes the second handler for this emission
        bus.emit(&Event::PeerLeft("bob".into()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(EventKind::PeerLeft), 0);

        bus.emit(&Event::PeerLeft("bob".into()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_single_handler() {
        let bus = EventBus::new();
        let a = bus.subscribe(EventKind::ChannelOpen, |_| Flow::Continue);
        bus.subscribe(EventKind::ChannelOpen, |_| Flow::Continue);
        bus.unsubscribe(EventKind::ChannelOpen, Some(a));
        assert_eq!(bus.handler_count(EventKind::ChannelOpen), 1);
    }

    #[test]
    fn test_named_subscription() {
        let bus = EventBus::new();
        assert!(bus.subscribe_named("peerJoined", |_| Flow::Continue).is_some());
        assert!(bus.subscribe_named("peerTeleported", |_| Flow::Continue).is_none());
        assert_eq!(EventKind::from_name("receivedDataStatus"), Some(EventKind::ReceivedDataStatus));
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
    }
}
