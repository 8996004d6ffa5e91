//! Room membership and per-peer offer/answer/ICE handshake.
//!
//! The machine is driven from a single task. Relay payloads come in through
//! [`SignalingMachine::handle_payload`], peer primitive completions through
//! [`SignalingMachine::handle_peer_event`]. Outbound envelopes are queued and
//! drained by the driver with [`SignalingMachine::take_outgoing`].

use std::collections::VecDeque;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use skyway_shared::constants::{DEFAULT_CHANNEL_SUFFIX, SELF_DISPLAY_NAME, TRANSFER_CLOSE_GRACE};
use skyway_shared::data_message::FileInfo;
use skyway_shared::error::{BootstrapError, MediaAccessError, NegotiationError, TransferError};
use skyway_shared::events::{Event, EventBus};
use skyway_shared::ice::IceConfig;
use skyway_shared::protocol::{
    self, CandidateMessage, Chat, Enter, Envelope, InRoom, JoinRoom, Redirect, RedirectAction,
    SdpMessage, Welcome,
};
use skyway_shared::session::{Credentials, NegotiationConfig, Session};
use skyway_shared::types::{
    CandidateGenerationState, ConnectionId, HandshakeStep, IceConnectionState, LocalStream, PeerId,
    PeerState, ReadyState, Role, RoomId, RoomState, SdpType, SessionDescription,
};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionConfig, PeerConnection, PeerConnector, PeerEvent, PeerOp, PeerSignal};
use crate::registry::{PeerEntry, PeerRegistry};
use crate::transfer::{TransferAction, TransferManager};

/// Outcome of [`SignalingMachine::join_room`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStep {
    AlreadyJoining,
    /// Credentials must be fetched first
    NeedBootstrap,
    /// The signaling channel must be opened; `joinRoom` is sent once it is
    NeedChannel,
    Sent,
}

pub struct SignalingMachine<C: PeerConnector> {
    connector: C,
    session: Session,
    room_state: RoomState,
    channel_open: bool,
    registry: PeerRegistry<C::Connection>,
    transfers: TransferManager,
    events: EventBus,
    outbox: VecDeque<Envelope>,
    next_connection: u64,
    display_name: Option<String>,
}

impl<C: PeerConnector> SignalingMachine<C> {
    pub fn new(connector: C, events: EventBus) -> Self {
        Self {
            connector,
            session: Session::default(),
            room_state: RoomState::Outside,
            channel_open: false,
            registry: PeerRegistry::new(),
            transfers: TransferManager::new(),
            events,
            outbox: VecDeque::new(),
            next_connection: 1,
            display_name: None,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn ready_state(&self) -> ReadyState {
        self.session.ready_state
    }

    pub fn room_state(&self) -> RoomState {
        self.room_state
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel_open
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.session.local_id()
    }

    pub fn peer(&self, id: &PeerId) -> Option<&PeerEntry<C::Connection>> {
        self.registry.get(id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.registry.ids()
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    /// WebSocket URL of the relay, once credentials are known
    pub fn signaling_url(&self) -> Option<String> {
        self.session
            .credentials
            .as_ref()
            .map(|c| c.signaling.ws_url())
    }

    pub fn display_name(&self) -> String {
        match (&self.display_name, &self.session.credentials) {
            (Some(name), _) => name.clone(),
            (None, Some(creds)) => creds.user.display_name.clone(),
            (None, None) => String::new(),
        }
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.display_name = Some(name.into());
    }

    /// Drain the envelopes queued for the relay
    pub fn take_outgoing(&mut self) -> Vec<Envelope> {
        self.outbox.drain(..).collect()
    }

    // ---- Bootstrap ----

    pub fn reset_readiness(&mut self) {
        self.set_ready_state(ReadyState::Uninitialized);
    }

    pub fn begin_bootstrap(&mut self) {
        self.set_ready_state(ReadyState::Loading);
    }

    /// Apply the bootstrap result. Returns `true` when a pending join now
    /// needs the signaling channel to be opened.
    pub fn complete_bootstrap(&mut self, result: Result<Credentials, BootstrapError>) -> bool {
        match result {
            Ok(creds) => {
                info!(
                    user = %creds.user.id.short(),
                    room = %creds.room.id,
                    signaling = %creds.signaling.ws_url(),
                    "Session bootstrapped"
                );
                self.session.credentials = Some(creds);
                self.set_ready_state(ReadyState::Ready);
                self.room_state == RoomState::Joining && !self.channel_open
            }
            Err(e) => {
                warn!(error = %e, "Bootstrap failed");
                self.set_ready_state(ReadyState::Uninitialized);
                if self.room_state == RoomState::Joining {
                    self.room_state = RoomState::Outside;
                }
                false
            }
        }
    }

    fn set_ready_state(&mut self, state: ReadyState) {
        self.session.ready_state = state;
        self.events.emit(&Event::ReadyStateChange(state));
    }

    // ---- Room ----

    pub fn join_room(&mut self) -> JoinStep {
        if self.room_state != RoomState::Outside {
            debug!("Already joining or inside the room");
            return JoinStep::AlreadyJoining;
        }
        self.room_state = RoomState::Joining;

        if !self.session.is_ready() {
            return JoinStep::NeedBootstrap;
        }
        if !self.channel_open {
            return JoinStep::NeedChannel;
        }
        self.send_join();
        JoinStep::Sent
    }

    fn send_join(&mut self) {
        let Some(creds) = &self.session.credentials else {
            warn!("Cannot join without credentials");
            return;
        };
        info!(room = %creds.room.id, "Joining room");
        let envelope = Envelope::JoinRoom(JoinRoom {
            mid: creds.user.id.clone(),
            rid: creds.room.id.clone(),
            cid: creds.cid.clone(),
            room_cred: creds.room.credential.clone(),
            user_cred: creds.user.credential.clone(),
            token_temp_created: creds.user.credential_created.clone(),
            time_stamp: creds.room.credential_timestamp.clone(),
        });
        self.send(envelope);
    }

    /// Leave the room. Returns `true` when the caller should close the
    /// signaling transport.
    pub fn leave_room(&mut self) -> bool {
        if self.room_state == RoomState::Outside {
            return false;
        }
        info!(peers = self.registry.len(), "Leaving room");

        for id in self.registry.ids() {
            self.remove_peer(&id);
        }
        self.transfers.clear();
        self.outbox.clear();
        self.room_state = RoomState::Outside;
        self.channel_open = false;
        self.set_ready_state(ReadyState::Uninitialized);
        true
    }

    // ---- Signaling channel ----

    pub fn channel_opened(&mut self) {
        debug!("Signaling channel open");
        self.channel_open = true;
        self.events.emit(&Event::ChannelOpen);
        if self.room_state == RoomState::Joining {
            self.send_join();
        }
    }

    pub fn channel_closed(&mut self) {
        debug!("Signaling channel closed");
        self.channel_open = false;
        if self.room_state == RoomState::Joining {
            self.room_state = RoomState::Outside;
        }
        self.events.emit(&Event::ChannelClose);
    }

    pub fn channel_error(&mut self, reason: &str) {
        warn!(reason, "Signaling channel error");
        self.channel_open = false;
        if self.room_state == RoomState::Joining {
            self.room_state = RoomState::Outside;
        }
        self.events.emit(&Event::ChannelError(reason.to_string()));
    }

    fn send(&mut self, envelope: Envelope) {
        if !self.channel_open {
            debug!(kind = envelope.kind(), "Channel closed, dropping outgoing message");
            return;
        }
        debug!(
            kind = envelope.kind(),
            target = envelope.target().map(PeerId::short).unwrap_or("server"),
            "Outgoing message"
        );
        self.outbox.push_back(envelope);
    }

    // ---- Inbound relay messages ----

    pub fn handle_payload(&mut self, payload: &[u8]) {
        match protocol::decode(payload) {
            Ok(frame) => {
                for envelope in frame.into_envelopes() {
                    self.handle_envelope(envelope);
                }
            }
            Err(e) => warn!(error = %e, "Dropping malformed signaling payload"),
        }
    }

    pub fn handle_envelope(&mut self, envelope: Envelope) {
        if let (Some(sender), Some(local)) = (envelope.sender(), self.local_id()) {
            if sender == local && !envelope.accepts_self_origin() {
                debug!(kind = envelope.kind(), "Ignoring own message");
                return;
            }
        }

        match envelope {
            Envelope::InRoom(msg) => self.on_in_room(msg),
            Envelope::Enter(msg) => self.on_enter(msg),
            Envelope::Welcome(msg) => self.on_welcome(msg),
            Envelope::Offer(msg) => self.on_offer(msg),
            Envelope::Answer(msg) => self.on_answer(msg),
            Envelope::Candidate(msg) => self.on_candidate(msg),
            Envelope::Bye(msg) => {
                info!(peer = %msg.mid.short(), "Peer said bye");
                self.remove_peer(&msg.mid);
            }
            Envelope::Chat(msg) => self.on_chat(msg),
            Envelope::Redirect(msg) => self.on_redirect(msg),
            Envelope::JoinRoom(msg) => {
                debug!(peer = %msg.mid.short(), "Ignoring joinRoom from relay");
            }
            notice @ (Envelope::UpdateGuestName(_)
            | Envelope::Error(_)
            | Envelope::Invite(_)
            | Envelope::VideoMuteEvent(_)
            | Envelope::RoomLockEvent(_)) => {
                debug!(kind = notice.kind(), "Ignoring relay notice");
            }
        }
    }

    fn on_in_room(&mut self, msg: InRoom) {
        let ice = IceConfig::from(&msg.pc_config);
        let Some(creds) = self.session.credentials.as_mut() else {
            warn!("inRoom received without credentials");
            return;
        };
        debug!(servers = ice.ice_servers.len(), "Received ICE configuration");
        creds.negotiation.ice = ice;
        let room = creds.room.id.clone();
        let local = creds.user.id.clone();

        self.room_state = RoomState::Inside;
        info!(room = %room, "Inside the room");
        self.events.emit(&Event::JoinedRoom(room.clone()));
        self.events.emit(&Event::HandshakeProgress {
            step: HandshakeStep::Enter,
            peer: None,
        });

        let nick = self.display_name();
        self.send(Envelope::Enter(Enter {
            mid: local,
            rid: room,
            nick,
        }));
    }

    fn on_enter(&mut self, msg: Enter) {
        let peer = msg.mid;
        if self.registry.contains(&peer) {
            debug!(peer = %peer.short(), "Enter from known peer");
            return;
        }
        let Some((local, room)) = self.identity() else {
            return;
        };

        self.registry.upsert(PeerEntry::pending(peer.clone(), Role::Answerer));
        self.progress(HandshakeStep::Enter, &peer);
        self.events.emit(&Event::PeerJoined(peer.clone()));
        self.progress(HandshakeStep::Welcome, &peer);

        debug!(peer = %peer.short(), "Sending welcome");
        let nick = self.display_name();
        self.send(Envelope::Welcome(Welcome {
            mid: local,
            target: peer,
            rid: room,
            nick,
        }));
    }

    fn on_welcome(&mut self, msg: Welcome) {
        let peer = msg.mid;
        let Some(local) = self.local_id().cloned() else {
            return;
        };

        let pending = self.registry.get(&peer).map(PeerEntry::is_pending);
        match pending {
            None => {
                self.progress(HandshakeStep::Welcome, &peer);
                self.events.emit(&Event::PeerJoined(peer.clone()));
                self.open_connection(&peer, Role::Offerer);
            }
            // Both sides sent welcome; the smaller id makes the offer
            Some(true) if local < peer => {
                debug!(peer = %peer.short(), "Crossed welcome, taking the offerer role");
                self.progress(HandshakeStep::Welcome, &peer);
                self.open_connection(&peer, Role::Offerer);
            }
            Some(_) => {
                debug!(peer = %peer.short(), "Ignoring welcome, negotiation already owned");
            }
        }
    }

    fn on_offer(&mut self, msg: SdpMessage) {
        let peer = msg.mid;
        self.progress(HandshakeStep::Offer, &peer);
        debug!(peer = %peer.short(), "Received offer");

        let needs_connection = self.registry.get(&peer).map_or(true, PeerEntry::is_pending);
        if needs_connection && !self.open_connection(&peer, Role::Answerer) {
            return;
        }
        if self.registry.get(&peer).is_some_and(|e| e.inert) {
            debug!(peer = %peer.short(), "Ignoring offer for failed negotiation");
            return;
        }
        self.execute(&peer, PeerOp::SetRemoteDescription(SessionDescription::offer(msg.sdp)));
    }

    fn on_answer(&mut self, msg: SdpMessage) {
        let peer = msg.mid;
        self.progress(HandshakeStep::Answer, &peer);
        debug!(peer = %peer.short(), "Received answer");
        if !self.execute(&peer, PeerOp::SetRemoteDescription(SessionDescription::answer(msg.sdp))) {
            warn!(peer = %peer.short(), "Answer for unknown peer connection");
        }
    }

    fn on_candidate(&mut self, msg: CandidateMessage) {
        let peer = msg.mid.clone();
        let candidate = msg.to_candidate();
        let Some(entry) = self.registry.get(&peer) else {
            debug!(peer = %peer.short(), "Dropping candidate, no peer connection");
            return;
        };
        let Some(conn) = entry.connection.as_ref() else {
            debug!(peer = %peer.short(), "Dropping candidate, no peer connection");
            return;
        };
        if entry.ice_state == IceConnectionState::Connected {
            debug!(peer = %peer.short(), "Already connected, not adding candidate");
            return;
        }
        debug!(
            peer = %peer.short(),
            kind = candidate.candidate_type().unwrap_or("unknown"),
            "Adding remote candidate"
        );
        conn.execute(PeerOp::AddIceCandidate(candidate));
    }

    fn on_chat(&mut self, msg: Chat) {
        let from_self = self.local_id() == Some(&msg.mid);
        let display_name = if from_self {
            SELF_DISPLAY_NAME.to_string()
        } else {
            msg.nick
        };
        self.events.emit(&Event::ChatMessage {
            message: msg.data,
            display_name,
            is_private: msg.target.is_some(),
        });
    }

    fn on_redirect(&mut self, msg: Redirect) {
        match msg.action {
            RedirectAction::Warning => {
                warn!(info = msg.info.as_deref().unwrap_or(""), "Relay warning");
            }
            RedirectAction::Reject | RedirectAction::Close => {
                warn!(
                    action = ?msg.action,
                    info = msg.info.as_deref().unwrap_or(""),
                    "Redirected by relay"
                );
                self.events.emit(&Event::Redirect {
                    action: msg.action,
                    url: msg.url,
                    info: msg.info,
                });
            }
        }
    }

    // ---- Peer connections ----

    fn identity(&self) -> Option<(PeerId, RoomId)> {
        let creds = self.session.credentials.as_ref();
        if creds.is_none() {
            warn!("No credentials, cannot address peers");
        }
        creds.map(|c| (c.user.id.clone(), c.room.id.clone()))
    }

    fn negotiation(&self) -> NegotiationConfig {
        self.session
            .credentials
            .as_ref()
            .map(|c| c.negotiation.clone())
            .unwrap_or_default()
    }

    fn progress(&self, step: HandshakeStep, peer: &PeerId) {
        self.events.emit(&Event::HandshakeProgress {
            step,
            peer: Some(peer.clone()),
        });
    }

    fn execute(&self, peer: &PeerId, op: PeerOp) -> bool {
        match self.registry.get(peer).and_then(|e| e.connection.as_ref()) {
            Some(conn) => {
                conn.execute(op);
                true
            }
            None => {
                debug!(peer = %peer.short(), "No connection for peer op");
                false
            }
        }
    }

    /// Create the connection for `peer` and replace any existing entry.
    fn open_connection(&mut self, peer: &PeerId, role: Role) -> bool {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;

        let negotiation = self.negotiation();
        let config = ConnectionConfig {
            ice: negotiation.ice.clone(),
            pc_constraints: negotiation.pc_constraints.clone(),
        };

        let conn = match self.connector.open(peer, id, &config) {
            Ok(conn) => conn,
            Err(e) => {
                if !self.registry.contains(peer) {
                    self.registry.upsert(PeerEntry::pending(peer.clone(), role));
                }
                self.fail_negotiation(peer, e);
                return false;
            }
        };
        debug!(peer = %peer.short(), connection = %id, ?role, "Created peer connection");

        let default_channel = (role == Role::Offerer).then(|| format!("{peer}{DEFAULT_CHANNEL_SUFFIX}"));
        if let Some(label) = &default_channel {
            conn.execute(PeerOp::CreateDataChannel {
                label: label.clone(),
            });
        }
        if self.session.local_streams.is_empty() {
            debug!(peer = %peer.short(), "No local stream, receiving only");
        }
        for stream in &self.session.local_streams {
            conn.execute(PeerOp::AddStream(stream.clone()));
        }
        if role == Role::Offerer {
            conn.execute(PeerOp::CreateOffer {
                constraints: negotiation.offer(),
            });
        }

        let mut entry = PeerEntry::negotiating(peer.clone(), conn, id, role);
        if let Some(label) = default_channel {
            entry.track_channel(&label);
        }
        if let Some(old) = self.registry.upsert(entry) {
            if let Some(old_conn) = old.connection {
                old_conn.execute(PeerOp::Close);
            }
        }
        true
    }

    fn fail_negotiation(&mut self, peer: &PeerId, reason: NegotiationError) {
        warn!(peer = %peer.short(), error = %reason, "Negotiation failed");
        if let Some(entry) = self.registry.get_mut(peer) {
            entry.inert = true;
        }
        self.events.emit(&Event::NegotiationError {
            peer: peer.clone(),
            reason,
        });
    }

    /// Close and forget `peer`. `peerLeft` is emitted even when the peer was
    /// never known.
    fn remove_peer(&mut self, peer: &PeerId) {
        if let Some(entry) = self.registry.remove(peer) {
            if let Some(conn) = entry.connection {
                conn.execute(PeerOp::Close);
            }
        }
        self.transfers.forget_peer(peer);
        self.events.emit(&Event::PeerLeft(peer.clone()));
    }

    /// Apply a completion or notification from a peer connection.
    pub fn handle_peer_event(&mut self, signal: PeerSignal) {
        let PeerSignal {
            peer,
            connection,
            event,
        } = signal;

        let Some(entry) = self.registry.get(&peer) else {
            debug!(peer = %peer.short(), "Signal for unknown peer dropped");
            return;
        };
        if entry.connection_for(connection).is_none() {
            debug!(peer = %peer.short(), connection = %connection, "Stale connection signal dropped");
            return;
        }
        let inert = entry.inert;

        match event {
            PeerEvent::OfferCreated(desc) | PeerEvent::AnswerCreated(desc) => {
                if !inert {
                    self.execute(&peer, PeerOp::SetLocalDescription(desc));
                }
            }
            PeerEvent::LocalDescriptionSet(desc) => {
                if inert {
                    return;
                }
                self.progress(HandshakeStep::from(desc.kind), &peer);
                if let Some((local, room)) = self.identity() {
                    debug!(peer = %peer.short(), kind = desc.kind.as_str(), "Sending local description");
                    self.send(Envelope::description(&desc, local, peer, room));
                }
            }
            PeerEvent::RemoteDescriptionSet(SdpType::Offer) => {
                if !inert {
                    let constraints = self.negotiation().answer();
                    self.execute(&peer, PeerOp::CreateAnswer { constraints });
                }
            }
            PeerEvent::RemoteDescriptionSet(SdpType::Answer) => {
                debug!(peer = %peer.short(), "Remote answer applied");
            }
            PeerEvent::Failed(reason) if reason.is_fatal() => self.fail_negotiation(&peer, reason),
            PeerEvent::Failed(reason) => {
                warn!(peer = %peer.short(), error = %reason, "Peer operation failed");
            }
            PeerEvent::LocalCandidate(Some(candidate)) => {
                if self.registry.get(&peer).is_some_and(|e| e.gathering_done) {
                    debug!(peer = %peer.short(), "Candidate after end of gathering ignored");
                    return;
                }
                let Some((local, room)) = self.identity() else {
                    return;
                };
                debug!(
                    peer = %peer.short(),
                    kind = candidate.candidate_type().unwrap_or("unknown"),
                    "Sending local candidate"
                );
                self.send(Envelope::Candidate(CandidateMessage {
                    label: candidate.sdp_mline_index,
                    id: candidate.sdp_mid,
                    candidate: candidate.candidate,
                    mid: local,
                    target: peer,
                    rid: room,
                }));
            }
            PeerEvent::LocalCandidate(None) => {
                debug!(peer = %peer.short(), "End of candidate gathering");
                if let Some(entry) = self.registry.get_mut(&peer) {
                    entry.gathering_done = true;
                }
                self.events.emit(&Event::CandidateGenerationState {
                    state: CandidateGenerationState::Done,
                    peer,
                });
            }
            PeerEvent::IceConnectionState(state) => self.on_ice_state(peer, state),
            PeerEvent::IceGatheringState(state) => {
                self.events.emit(&Event::CandidateGenerationState { state, peer });
            }
            PeerEvent::SignalingState(state) => {
                if let Some(entry) = self.registry.get_mut(&peer) {
                    entry.signaling_state = state;
                }
                self.events.emit(&Event::PeerConnectionState { state, peer });
            }
            PeerEvent::RemoteStream(stream) => {
                debug!(peer = %peer.short(), kind = ?stream.kind, "Remote stream added");
                self.events.emit(&Event::AddPeerStream { peer, stream });
            }
            PeerEvent::DataChannelOpen { label, remote } => {
                debug!(peer = %peer.short(), channel = %label, remote, "Data channel open");
                if let Some(entry) = self.registry.get_mut(&peer) {
                    entry.track_channel(&label);
                }
                let actions = self.transfers.channel_open(&peer, &label, remote);
                self.apply(actions);
            }
            PeerEvent::DataChannelMessage { label, text } => {
                let Some(local) = self.local_id().cloned() else {
                    return;
                };
                let actions = self.transfers.handle_message(&local, &peer, &label, &text);
                self.apply(actions);
            }
            PeerEvent::DataChannelClosed { label } => {
                debug!(peer = %peer.short(), channel = %label, "Data channel closed");
                if let Some(entry) = self.registry.get_mut(&peer) {
                    entry.forget_channel(&label);
                }
                self.transfers.channel_closed(&label);
            }
            PeerEvent::DataChannelError { label, reason } => {
                let actions = self.transfers.channel_error(&label, &reason);
                self.apply(actions);
            }
        }
    }

    fn on_ice_state(&mut self, peer: PeerId, state: IceConnectionState) {
        debug!(peer = %peer.short(), ?state, "ICE connection state");
        if let Some(entry) = self.registry.get_mut(&peer) {
            entry.ice_state = state;
            if state.is_established() && entry.state != PeerState::Connected {
                info!(peer = %peer.short(), "Peer connected");
                entry.state = PeerState::Connected;
            }
        }
        self.events.emit(&Event::IceConnectionState {
            state,
            peer: peer.clone(),
        });

        if state == IceConnectionState::Failed {
            warn!(peer = %peer.short(), "ICE failed, dropping peer");
            self.remove_peer(&peer);
        }
    }

    fn apply(&mut self, actions: Vec<TransferAction>) {
        for action in actions {
            match action {
                TransferAction::CreateChannel { peer, label } => {
                    if let Some(entry) = self.registry.get_mut(&peer) {
                        if let Some(conn) = &entry.connection {
                            conn.execute(PeerOp::CreateDataChannel {
                                label: label.clone(),
                            });
                        }
                        entry.track_channel(&label);
                    }
                }
                TransferAction::Send { peer, label, text } => {
                    self.execute(&peer, PeerOp::SendData { label, text });
                }
                TransferAction::CloseChannel { peer, label } => {
                    self.execute(
                        &peer,
                        PeerOp::CloseDataChannel {
                            label,
                            after: TRANSFER_CLOSE_GRACE,
                        },
                    );
                }
                TransferAction::Emit(event) => self.events.emit(&event),
            }
        }
    }

    // ---- Application requests ----

    pub fn send_chat(&mut self, data: Value, target: Option<PeerId>) {
        let Some(creds) = &self.session.credentials else {
            warn!("Cannot chat before bootstrap");
            return;
        };
        let nick = self.display_name();
        let envelope = Envelope::Chat(Chat {
            cid: creds.cid.clone(),
            data: data.clone(),
            mid: creds.user.id.clone(),
            nick: nick.clone(),
            rid: creds.room.id.clone(),
            target: target.clone(),
        });
        self.send(envelope);
        self.events.emit(&Event::ChatMessage {
            message: data,
            display_name: nick,
            is_private: target.is_some(),
        });
    }

    /// Send a file to every connected peer. Returns the item id.
    /// Send a file to every connected peer, or to `target` only.
    pub fn send_file(
        &mut self,
        file: FileInfo,
        data: Bytes,
        target: Option<&PeerId>,
    ) -> Result<String, TransferError> {
        if self.room_state != RoomState::Inside {
            return Err(TransferError::NotInRoom);
        }
        let local = self.local_id().cloned().ok_or(TransferError::NotInRoom)?;
        let mut peers = self.registry.connected_ids();
        if let Some(target) = target {
            if !peers.contains(target) {
                return Err(TransferError::UnknownPeer(target.clone()));
            }
            peers = vec![target.clone()];
        }
        info!(name = %file.name, size = file.size, peers = peers.len(), "Sending file");

        let (item_id, actions) = self.transfers.send_file(&local, file, data, &peers, Utc::now())?;
        self.apply(actions);
        Ok(item_id)
    }

    /// Register a local capture stream. It is attached to connections
    /// created from now on.
    pub fn add_local_stream(&mut self, stream: LocalStream) {
        info!(stream = %stream.id, tracks = stream.tracks.len(), "Local media available");
        self.session.local_streams.push(stream.clone());
        self.events.emit(&Event::MediaAccessSuccess(stream));
    }

    pub fn media_access_failed(&mut self, error: MediaAccessError) {
        warn!(error = %error, "Local media unavailable");
        self.events.emit(&Event::MediaAccessError(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use skyway_shared::constants::CHUNK_SIZE;
    use skyway_shared::events::{EventKind, Flow};
    use skyway_shared::ice::{WireIceServer, WirePcConfig};
    use skyway_shared::session::{MediaConstraints, RoomInfo, SignalingEndpoint, UserInfo};
    use skyway_shared::types::IceCandidate;

    use super::*;
    use crate::mock::{MockConnector, OpRecord};

    fn credentials(id: &str) -> Credentials {
        Credentials {
            cid: "apikey".into(),
            user: UserInfo {
                id: id.into(),
                display_name: id.to_uppercase(),
                credential: "ucred".into(),
                credential_created: json!("2014-05-06T10:00:00Z"),
            },
            room: RoomInfo {
                id: "lobby".into(),
                credential: "rcred".into(),
                credential_timestamp: json!(1399370400),
            },
            signaling: SignalingEndpoint {
                host: "127.0.0.1".into(),
                port: 8000,
            },
            negotiation: NegotiationConfig {
                sdp_constraints: MediaConstraints::receive_all(),
                ..Default::default()
            },
        }
    }

    struct Client {
        id: PeerId,
        machine: SignalingMachine<MockConnector>,
        connector: MockConnector,
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl Client {
        fn new(id: &str) -> Self {
            let connector = MockConnector::new();
            let bus = EventBus::new();
            let events = Arc::new(Mutex::new(Vec::new()));
            for kind in EventKind::ALL {
                let log = events.clone();
                bus.subscribe(kind, move |e| {
                    log.lock().unwrap().push(e.clone());
                    Flow::Continue
                });
            }
            let mut machine = SignalingMachine::new(connector.clone(), bus);
            machine.begin_bootstrap();
            machine.complete_bootstrap(Ok(credentials(id)));
            machine.channel_opened();
            Self {
                id: id.into(),
                machine,
                connector,
                events,
            }
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
            self.events().iter().filter(|e| pred(e)).count()
        }
    }

    /// Relay plus scripted peer primitives for several in-process clients.
    struct Harness {
        clients: Vec<Client>,
        members: Vec<usize>,
        history: Vec<(usize, OpRecord)>,
        auto_connect: bool,
        pending_channels: Vec<(usize, PeerId, String)>,
    }

    impl Harness {
        fn new(ids: &[&str]) -> Self {
            Self {
                clients: ids.iter().map(|id| Client::new(id)).collect(),
                members: Vec::new(),
                history: Vec::new(),
                auto_connect: true,
                pending_channels: Vec::new(),
            }
        }

        fn index(&self, id: &PeerId) -> Option<usize> {
            self.clients.iter().position(|c| &c.id == id)
        }

        fn join(&mut self, i: usize) {
            assert_eq!(self.clients[i].machine.join_room(), JoinStep::Sent);
        }

        fn pump(&mut self) {
            for _ in 0..10_000 {
                let mut moved = false;
                for i in 0..self.clients.len() {
                    for envelope in self.clients[i].machine.take_outgoing() {
                        moved = true;
                        self.route(i, envelope);
                    }
                }
                for i in 0..self.clients.len() {
                    for record in self.clients[i].connector.take_ops() {
                        moved = true;
                        self.history.push((i, record.clone()));
                        self.apply_op(i, record);
                    }
                }
                if !moved {
                    return;
                }
            }
            panic!("harness did not settle");
        }

        fn route(&mut self, from: usize, envelope: Envelope) {
            if let Envelope::JoinRoom(join) = &envelope {
                let in_room = Envelope::InRoom(InRoom {
                    pc_config: WirePcConfig {
                        ice_servers: vec![WireIceServer {
                            url: Some("stun:stun.example.org:3478".into()),
                            ..Default::default()
                        }],
                    },
                    rid: Some(join.rid.clone()),
                    mid: None,
                });
                self.members.push(from);
                self.clients[from].machine.handle_envelope(in_room);
                return;
            }
            match envelope.target().cloned() {
                Some(target) => {
                    if let Some(j) = self.index(&target) {
                        self.clients[j].machine.handle_envelope(envelope);
                    }
                }
                None => {
                    for j in self.members.clone() {
                        if j != from {
                            self.clients[j].machine.handle_envelope(envelope.clone());
                        }
                    }
                }
            }
        }

        /// Deliver `event` to client `i` for its connection with `peer`.
        fn signal(&mut self, i: usize, peer: &PeerId, event: PeerEvent) {
            let Some(generation) = self.clients[i].machine.peer(peer).and_then(|e| e.generation) else {
                return;
            };
            self.clients[i]
                .machine
                .handle_peer_event(PeerSignal::new(peer.clone(), generation, event));
        }

        fn is_connected(&self, i: usize, peer: &PeerId) -> bool {
            self.clients[i]
                .machine
                .peer(peer)
                .is_some_and(|e| e.ice_state.is_established())
        }

        fn open_channel(&mut self, i: usize, peer: &PeerId, label: String) {
            let me = self.clients[i].id.clone();
            self.signal(i, peer, PeerEvent::DataChannelOpen {
                label: label.clone(),
                remote: false,
            });
            if let Some(j) = self.index(peer) {
                self.signal(j, &me, PeerEvent::DataChannelOpen { label, remote: true });
            }
        }

        fn apply_op(&mut self, i: usize, record: OpRecord) {
            let me = self.clients[i].id.clone();
            let peer = record.peer.clone();
            let sdp = |kind: &str| format!("v=0 {kind} {me}->{peer}");
            match record.op {
                PeerOp::CreateOffer { .. } => {
                    let desc = SessionDescription::offer(sdp("offer"));
                    self.signal(i, &peer, PeerEvent::OfferCreated(desc));
                }
                PeerOp::CreateAnswer { .. } => {
                    let desc = SessionDescription::answer(sdp("answer"));
                    self.signal(i, &peer, PeerEvent::AnswerCreated(desc));
                }
                PeerOp::SetLocalDescription(desc) => {
                    self.signal(i, &peer, PeerEvent::LocalDescriptionSet(desc));
                }
                PeerOp::SetRemoteDescription(desc) => {
                    self.signal(i, &peer, PeerEvent::RemoteDescriptionSet(desc.kind));
                    if desc.kind == SdpType::Answer && self.auto_connect {
                        self.connect(i, &peer);
                    }
                }
                PeerOp::CreateDataChannel { label } => {
                    if self.is_connected(i, &peer) {
                        self.open_channel(i, &peer, label);
                    } else {
                        self.pending_channels.push((i, peer, label));
                    }
                }
                PeerOp::SendData { label, text } => {
                    if let Some(j) = self.index(&peer) {
                        self.signal(j, &me, PeerEvent::DataChannelMessage { label, text });
                    }
                }
                PeerOp::CloseDataChannel { label, .. } => {
                    self.signal(i, &peer, PeerEvent::DataChannelClosed {
                        label: label.clone(),
                    });
                    if let Some(j) = self.index(&peer) {
                        self.signal(j, &me, PeerEvent::DataChannelClosed { label });
                    }
                }
                PeerOp::AddIceCandidate(_) | PeerOp::AddStream(_) | PeerOp::Close => {}
            }
        }

        fn connect(&mut self, i: usize, peer: &PeerId) {
            let me = self.clients[i].id.clone();
            let Some(j) = self.index(peer) else {
                return;
            };
            self.signal(i, peer, PeerEvent::IceConnectionState(IceConnectionState::Connected));
            self.signal(j, &me, PeerEvent::IceConnectionState(IceConnectionState::Connected));

            let pending = std::mem::take(&mut self.pending_channels);
            for (owner, target, label) in pending {
                let pair = (owner == i && &target == peer) || (owner == j && target == me);
                if pair {
                    self.open_channel(owner, &target, label);
                } else {
                    self.pending_channels.push((owner, target, label));
                }
            }
        }

        fn ops_of(&self, i: usize, pred: impl Fn(&PeerOp) -> bool) -> Vec<OpRecord> {
            self.history
                .iter()
                .filter(|(owner, r)| *owner == i && pred(&r.op))
                .map(|(_, r)| r.clone())
                .collect()
        }
    }

    fn peer_joined(id: &str) -> impl Fn(&Event) -> bool + '_ {
        move |e| matches!(e, Event::PeerJoined(p) if p.as_str() == id)
    }

    #[test]
    fn test_two_client_handshake() {
        let mut h = Harness::new(&["alice", "bob"]);
        h.join(0);
        h.pump();
        h.join(1);
        h.pump();

        let alice = &h.clients[0];
        let bob = &h.clients[1];
        assert_eq!(alice.count(peer_joined("bob")), 1);
        assert_eq!(bob.count(peer_joined("alice")), 1);

        let bob_entry = bob.machine.peer(&"alice".into()).unwrap();
        assert_eq!(bob_entry.role, Role::Offerer);
        assert_eq!(bob_entry.state, PeerState::Connected);
        assert_eq!(bob_entry.channels, vec!["alice_offer".to_string()]);
        let alice_entry = alice.machine.peer(&"bob".into()).unwrap();
        assert_eq!(alice_entry.role, Role::Answerer);
        assert_eq!(alice_entry.state, PeerState::Connected);

        let steps: Vec<(HandshakeStep, Option<String>)> = bob
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::HandshakeProgress { step, peer } => Some((step, peer.map(|p| p.0))),
                _ => None,
            })
            .collect();
        let alice_id = Some("alice".to_string());
        assert_eq!(
            steps,
            vec![
                (HandshakeStep::Enter, None),
                (HandshakeStep::Welcome, alice_id.clone()),
                (HandshakeStep::Offer, alice_id.clone()),
                (HandshakeStep::Answer, alice_id),
            ]
        );

        // The receiving side of the default channel announces itself once
        let connected = h.ops_of(0, |op| matches!(op, PeerOp::SendData { label, .. } if label == "alice_offer"));
        assert_eq!(connected.len(), 1);
    }

    #[test]
    fn test_crossed_welcome_resolves_to_one_offerer() {
        let mut h = Harness::new(&["alice", "bob"]);
        h.join(0);
        h.join(1);
        h.pump();

        let offers_alice = h.ops_of(0, |op| matches!(op, PeerOp::CreateOffer { .. })).len();
        let offers_bob = h.ops_of(1, |op| matches!(op, PeerOp::CreateOffer { .. })).len();
        assert_eq!((offers_alice, offers_bob), (1, 0));

        assert_eq!(h.clients[0].count(peer_joined("bob")), 1);
        assert_eq!(h.clients[1].count(peer_joined("alice")), 1);
        assert!(h.is_connected(0, &"bob".into()));
        assert!(h.is_connected(1, &"alice".into()));
    }

    #[test]
    fn test_interleaved_candidates() {
        let mut h = Harness::new(&["alice", "bob"]);
        h.auto_connect = false;
        h.join(0);
        h.pump();
        h.join(1);
        h.pump();

        let alice_id = PeerId::from("alice");
        let bob_id = PeerId::from("bob");
        let candidate = |from: &str, n: usize| IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5{n:04} typ host {from}"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };

        for n in 0..10 {
            h.signal(0, &bob_id, PeerEvent::LocalCandidate(Some(candidate("alice", n))));
            h.signal(1, &alice_id, PeerEvent::LocalCandidate(Some(candidate("bob", n))));
            h.pump();
        }

        let applied = |h: &Harness, i: usize| -> Vec<String> {
            h.ops_of(i, |op| matches!(op, PeerOp::AddIceCandidate(_)))
                .into_iter()
                .filter_map(|r| match r.op {
                    PeerOp::AddIceCandidate(c) => Some(c.candidate),
                    _ => None,
                })
                .collect()
        };
        let at_alice = applied(&h, 0);
        let at_bob = applied(&h, 1);
        assert_eq!(at_alice.len(), 10);
        assert_eq!(at_bob.len(), 10);
        assert!(at_alice.iter().all(|c| c.ends_with("bob")));
        assert_eq!(at_bob[3], candidate("alice", 3).candidate);

        // End of gathering stops further sends
        h.signal(0, &bob_id, PeerEvent::LocalCandidate(None));
        h.signal(0, &bob_id, PeerEvent::LocalCandidate(Some(candidate("alice", 99))));
        assert!(h.clients[0].machine.take_outgoing().is_empty());
        assert_eq!(
            h.clients[0].count(|e| matches!(
                e,
                Event::CandidateGenerationState {
                    state: CandidateGenerationState::Done,
                    ..
                }
            )),
            1
        );
    }

    #[test]
    fn test_candidates_dropped_or_ignored() {
        let mut h = Harness::new(&["alice", "bob"]);
        h.join(0);
        h.pump();
        h.join(1);
        h.pump();

        let msg = |mid: &str| {
            Envelope::Candidate(CandidateMessage {
                label: Some(0),
                id: None,
                candidate: "candidate:1 1 udp 1 10.0.0.9 5000 typ host".into(),
                mid: mid.into(),
                target: "alice".into(),
                rid: "lobby".into(),
            })
        };
        // no connection for carol, and bob is already connected
        h.clients[0].machine.handle_envelope(msg("carol"));
        h.clients[0].machine.handle_envelope(msg("bob"));
        assert!(h.clients[0].connector.take_ops().is_empty());
    }

    #[test]
    fn test_file_to_two_peers() {
        let mut h = Harness::new(&["alice", "bob", "carol"]);
        for i in 0..3 {
            h.join(i);
            h.pump();
        }
        assert_eq!(h.clients[0].machine.registry.connected_ids().len(), 2);

        let payload: Vec<u8> = (0..150 * 1024).map(|i| (i % 241) as u8).collect();
        let payload = Bytes::from(payload);
        let file = FileInfo {
            name: "photo.jpg".into(),
            size: payload.len() as u64,
            item_type: "image/jpeg".into(),
        };
        let item_id = h.clients[0].machine.send_file(file, payload.clone(), None).unwrap();
        assert!(item_id.starts_with("alice"));
        h.pump();

        for i in [1, 2] {
            let received: Vec<_> = h.clients[i]
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::ReceivedData { item, self_id } => Some((item, self_id)),
                    _ => None,
                })
                .collect();
            assert_eq!(received.len(), 1);
            let (item, self_id) = &received[0];
            assert_eq!(item.data, payload);
            assert_eq!(item.sender, PeerId::from("alice"));
            assert_eq!(item.info.item_id, item_id);
            assert_eq!(self_id, &h.clients[i].id);
        }

        let alice = &h.clients[0];
        assert_eq!(alice.count(|e| matches!(e, Event::ReceivedDataStatus(_))), 2);
        assert_eq!(alice.count(|e| matches!(e, Event::ReceivedData { .. })), 1);
        let sent_chunks = h.ops_of(0, |op| matches!(op, PeerOp::SendData { text, .. } if text.contains("\"sending\"")));
        assert_eq!(sent_chunks.len(), 2 * payload.len().div_ceil(CHUNK_SIZE));
        let closes = h.ops_of(0, |op| {
            matches!(op, PeerOp::CloseDataChannel { after, .. } if *after == TRANSFER_CLOSE_GRACE)
        });
        assert_eq!(closes.len(), 2);

        // closed channels release every buffer on both sides
        for client in &h.clients {
            assert_eq!(client.machine.transfers.records().count(), 0);
            assert_eq!(client.machine.transfers.pending_items(), 0);
        }
    }

    #[test]
    fn test_file_to_one_peer() {
        let mut h = Harness::new(&["alice", "bob", "carol"]);
        for i in 0..3 {
            h.join(i);
            h.pump();
        }
        let file = FileInfo {
            name: "notes.txt".into(),
            size: 5,
            item_type: "text/plain".into(),
        };
        let bob = PeerId::from("bob");
        h.clients[0]
            .machine
            .send_file(file.clone(), Bytes::from_static(b"hello"), Some(&bob))
            .unwrap();
        h.pump();

        assert_eq!(h.clients[1].count(|e| matches!(e, Event::ReceivedData { .. })), 1);
        assert_eq!(h.clients[2].count(|e| matches!(e, Event::ReceivedData { .. })), 0);
        assert_eq!(h.clients[0].count(|e| matches!(e, Event::ReceivedDataStatus(_))), 1);

        let err = h.clients[0]
            .machine
            .send_file(file, Bytes::from_static(b"hello"), Some(&"dave".into()))
            .unwrap_err();
        assert_eq!(err, TransferError::UnknownPeer("dave".into()));
    }

    #[test]
    fn test_send_file_without_peers() {
        let mut h = Harness::new(&["alice"]);
        h.join(0);
        h.pump();
        let file = FileInfo {
            name: "a".into(),
            size: 1,
            item_type: "text/plain".into(),
        };
        let err = h.clients[0]
            .machine
            .send_file(file, Bytes::from_static(b"a"), None)
            .unwrap_err();
        assert_eq!(err, TransferError::NoPeers);
    }

    #[test]
    fn test_bye_for_unknown_peer_still_emits_left() {
        let mut client = Client::new("alice");
        client.machine.handle_envelope(Envelope::Bye(protocol::Bye {
            mid: "ghost".into(),
            rid: None,
        }));
        assert_eq!(
            client.count(|e| matches!(e, Event::PeerLeft(p) if p.as_str() == "ghost")),
            1
        );
    }

    #[test]
    fn test_stale_signal_dropped() {
        let mut h = Harness::new(&["alice", "bob"]);
        h.join(0);
        h.pump();
        h.join(1);
        h.pump();

        let bob = PeerId::from("bob");
        h.clients[0].machine.handle_peer_event(PeerSignal::new(
            bob.clone(),
            ConnectionId(999),
            PeerEvent::IceConnectionState(IceConnectionState::Failed),
        ));
        assert!(h.clients[0].machine.peer(&bob).is_some());
    }

    #[test]
    fn test_ice_failure_removes_peer() {
        let mut h = Harness::new(&["alice", "bob"]);
        h.join(0);
        h.pump();
        h.join(1);
        h.pump();

        let bob = PeerId::from("bob");
        h.signal(0, &bob, PeerEvent::IceConnectionState(IceConnectionState::Failed));
        assert!(h.clients[0].machine.peer(&bob).is_none());
        assert_eq!(h.clients[0].count(|e| matches!(e, Event::PeerLeft(p) if p == &bob)), 1);
    }

    #[test]
    fn test_negotiation_failure_marks_inert() {
        let mut h = Harness::new(&["alice", "bob"]);
        h.join(0);
        h.pump();
        h.join(1);
        // deliver bob's enter and alice's welcome, then fail bob's offer
        for _ in 0..3 {
            for i in 0..2 {
                for envelope in h.clients[i].machine.take_outgoing() {
                    h.route(i, envelope);
                }
            }
        }
        let alice = PeerId::from("alice");
        h.signal(
            1,
            &alice,
            PeerEvent::Failed(NegotiationError::CreateOffer("no codecs".into())),
        );
        h.signal(1, &alice, PeerEvent::OfferCreated(SessionDescription::offer("v=0")));

        let entry = h.clients[1].machine.peer(&alice).unwrap();
        assert!(entry.inert);
        let set_local = h.clients[1]
            .connector
            .take_ops()
            .into_iter()
            .filter(|r| matches!(r.op, PeerOp::SetLocalDescription(_)))
            .count();
        assert_eq!(set_local, 0);
        assert_eq!(
            h.clients[1].count(|e| matches!(e, Event::NegotiationError { .. })),
            1
        );
    }

    #[test]
    fn test_rejected_candidate_keeps_handshake() {
        let mut h = Harness::new(&["alice", "bob"]);
        h.join(0);
        h.pump();
        h.join(1);
        for _ in 0..3 {
            for i in 0..2 {
                for envelope in h.clients[i].machine.take_outgoing() {
                    h.route(i, envelope);
                }
            }
        }
        let alice = PeerId::from("alice");
        h.signal(
            1,
            &alice,
            PeerEvent::Failed(NegotiationError::AddIceCandidate("bad candidate".into())),
        );
        let offer = SessionDescription::offer("v=0");
        h.signal(1, &alice, PeerEvent::OfferCreated(offer.clone()));

        assert!(!h.clients[1].machine.peer(&alice).unwrap().inert);
        let set_local = h.clients[1]
            .connector
            .take_ops()
            .into_iter()
            .filter(|r| matches!(r.op, PeerOp::SetLocalDescription(_)))
            .count();
        assert_eq!(set_local, 1);

        h.signal(1, &alice, PeerEvent::LocalDescriptionSet(offer));
        let out = h.clients[1].machine.take_outgoing();
        assert!(out.iter().any(|e| matches!(e, Envelope::Offer(m) if m.target == alice)));
        assert_eq!(h.clients[1].count(|e| matches!(e, Event::NegotiationError { .. })), 0);
    }

    #[test]
    fn test_data_channel_failure_is_not_fatal() {
        let mut h = Harness::new(&["alice", "bob"]);
        h.join(0);
        h.pump();
        h.join(1);
        h.pump();
        let alice = PeerId::from("alice");
        h.signal(
            1,
            &alice,
            PeerEvent::Failed(NegotiationError::DataChannel("too large".into())),
        );
        h.signal(1, &alice, PeerEvent::DataChannelError {
            label: "alice_offer".into(),
            reason: "too large".into(),
        });

        assert!(!h.clients[1].machine.peer(&alice).unwrap().inert);
        assert_eq!(h.clients[1].count(|e| matches!(e, Event::NegotiationError { .. })), 0);
        assert_eq!(
            h.clients[1].count(|e| matches!(e, Event::DataChannelError { channel, .. } if channel == "alice_offer")),
            1
        );
    }

    #[test]
    fn test_refused_connection_reports_error() {
        let mut h = Harness::new(&["alice", "bob"]);
        h.clients[1].connector.refuse("alice".into());
        h.join(0);
        h.pump();
        h.join(1);
        h.pump();
        assert!(h.clients[1].machine.peer(&"alice".into()).unwrap().inert);
        assert_eq!(h.clients[1].count(|e| matches!(e, Event::NegotiationError { .. })), 1);
    }

    #[test]
    fn test_join_steps_and_leave() {
        let connector = MockConnector::new();
        let mut machine = SignalingMachine::new(connector, EventBus::new());
        assert_eq!(machine.join_room(), JoinStep::NeedBootstrap);
        assert_eq!(machine.join_room(), JoinStep::AlreadyJoining);

        machine.begin_bootstrap();
        assert!(machine.complete_bootstrap(Ok(credentials("alice"))));
        assert_eq!(machine.ready_state(), ReadyState::Ready);

        machine.channel_opened();
        let out = machine.take_outgoing();
        assert!(matches!(out.as_slice(), [Envelope::JoinRoom(j)] if j.cid == "apikey"));

        assert!(machine.leave_room());
        assert_eq!(machine.room_state(), RoomState::Outside);
        assert_eq!(machine.ready_state(), ReadyState::Uninitialized);
        assert!(!machine.leave_room());
        assert_eq!(machine.join_room(), JoinStep::NeedBootstrap);
    }

    #[test]
    fn test_bootstrap_failure_resets_join() {
        let mut machine = SignalingMachine::new(MockConnector::new(), EventBus::new());
        assert_eq!(machine.join_room(), JoinStep::NeedBootstrap);
        machine.begin_bootstrap();
        assert!(!machine.complete_bootstrap(Err(BootstrapError::Status(500))));
        assert_eq!(machine.ready_state(), ReadyState::Uninitialized);
        assert_eq!(machine.room_state(), RoomState::Outside);
    }

    #[test]
    fn test_leave_room_closes_every_peer() {
        let mut h = Harness::new(&["alice", "bob", "carol"]);
        for i in 0..3 {
            h.join(i);
            h.pump();
        }
        assert!(h.clients[0].machine.leave_room());
        let closes = h.clients[0]
            .connector
            .take_ops()
            .into_iter()
            .filter(|r| r.op == PeerOp::Close)
            .count();
        assert_eq!(closes, 2);
        assert_eq!(h.clients[0].count(|e| matches!(e, Event::PeerLeft(_))), 2);
        assert!(h.clients[0].machine.peer_ids().is_empty());
    }

    #[test]
    fn test_chat_and_self_filter() {
        let mut client = Client::new("alice");
        client.machine.handle_envelope(Envelope::Enter(Enter {
            mid: "alice".into(),
            rid: "lobby".into(),
            nick: "ALICE".into(),
        }));
        assert!(client.machine.peer_ids().is_empty());

        client.machine.handle_envelope(Envelope::Chat(Chat {
            cid: "apikey".into(),
            data: json!("hi"),
            mid: "alice".into(),
            nick: "ALICE".into(),
            rid: "lobby".into(),
            target: Some("bob".into()),
        }));
        let chats: Vec<_> = client
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::ChatMessage {
                    display_name,
                    is_private,
                    ..
                } => Some((display_name, is_private)),
                _ => None,
            })
            .collect();
        assert_eq!(chats, vec![(SELF_DISPLAY_NAME.to_string(), true)]);
    }

    #[test]
    fn test_send_chat_uses_display_name() {
        let mut client = Client::new("alice");
        client.machine.set_display_name("Alice Liddell");
        client.machine.send_chat(json!({"msg": "hello"}), None);
        match client.machine.take_outgoing().as_slice() {
            [Envelope::Chat(chat)] => {
                assert_eq!(chat.nick, "Alice Liddell");
                assert!(chat.target.is_none());
            }
            other => panic!("unexpected outbox: {other:?}"),
        }

        client.machine.channel_closed();
        client.machine.send_chat(json!("lost"), None);
        assert!(client.machine.take_outgoing().is_empty());
    }

    #[test]
    fn test_redirect_actions() {
        let mut client = Client::new("alice");
        for action in [RedirectAction::Warning, RedirectAction::Reject] {
            client.machine.handle_envelope(Envelope::Redirect(Redirect {
                action,
                url: Some("https://example.org".into()),
                info: Some("full".into()),
                mid: None,
                rid: None,
            }));
        }
        assert_eq!(
            client.count(|e| matches!(
                e,
                Event::Redirect {
                    action: RedirectAction::Reject,
                    ..
                }
            )),
            1
        );
        assert_eq!(client.count(|e| matches!(e, Event::Redirect { .. })), 1);
    }

    #[test]
    fn test_local_stream_attached_to_new_connections() {
        let mut h = Harness::new(&["alice", "bob"]);
        let stream = LocalStream::audio_video();
        h.clients[1].machine.add_local_stream(stream.clone());
        h.join(0);
        h.pump();
        h.join(1);
        h.pump();

        let added = h.ops_of(1, |op| matches!(op, PeerOp::AddStream(s) if s == &stream));
        assert_eq!(added.len(), 1);
        assert_eq!(
            h.clients[1].count(|e| matches!(e, Event::MediaAccessSuccess(_))),
            1
        );

        let offer = h.ops_of(1, |op| matches!(op, PeerOp::CreateOffer { .. }));
        let PeerOp::CreateOffer { constraints } = &offer[0].op else {
            unreachable!()
        };
        assert!(constraints.offer_to_receive_audio());
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let mut client = Client::new("alice");
        client.machine.handle_payload(b"{\"type\":\"nope\"}");
        client.machine.handle_payload(b"garbage");
        let group = protocol::encode_group(&[
            Envelope::Enter(Enter {
                mid: "bob".into(),
                rid: "lobby".into(),
                nick: "BOB".into(),
            }),
            Envelope::Bye(protocol::Bye {
                mid: "bob".into(),
                rid: None,
            }),
        ])
        .unwrap();
        client.machine.handle_payload(group.as_bytes());
        let kinds: Vec<EventKind> = client
            .events()
            .iter()
            .map(Event::kind)
            .filter(|k| matches!(k, EventKind::PeerJoined | EventKind::PeerLeft))
            .collect();
        assert_eq!(kinds, vec![EventKind::PeerJoined, EventKind::PeerLeft]);
    }
}
