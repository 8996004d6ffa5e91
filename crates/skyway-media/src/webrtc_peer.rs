//! [`PeerConnector`] backed by webrtc-rs.
//!
//! Each connection is owned by one tokio task that applies [`PeerOp`]s in
//! the order they were queued. Callback results are forwarded to the
//! signaling loop as [`PeerSignal`]s.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use skyway_shared::error::NegotiationError;
use skyway_shared::ice::IceServer;
use skyway_shared::session::MediaConstraints;
use skyway_shared::types::{
    CandidateGenerationState, ConnectionId, IceCandidate, IceConnectionState, PeerId, RemoteStream,
    SdpType, SessionDescription, SignalingState, TrackKind,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::connection::{ConnectionConfig, PeerConnection, PeerConnector, PeerEvent, PeerOp, PeerSignal};

type Channels = Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>;

/// Opens webrtc-rs peer connections on the current tokio runtime.
pub struct WebRtcConnector {
    api: Arc<API>,
    signals: mpsc::UnboundedSender<PeerSignal>,
}

impl WebRtcConnector {
    pub fn new(signals: mpsc::UnboundedSender<PeerSignal>) -> Result<Self, webrtc::Error> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Arc::new(api),
            signals,
        })
    }
}

impl PeerConnector for WebRtcConnector {
    type Connection = WebRtcConnection;

    fn open(
        &mut self,
        peer: &PeerId,
        id: ConnectionId,
        config: &ConnectionConfig,
    ) -> Result<WebRtcConnection, NegotiationError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| NegotiationError::PeerConnection(e.to_string()))?;

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let emitter = Emitter {
            peer: peer.clone(),
            connection: id,
            tx: self.signals.clone(),
        };
        runtime.spawn(run_peer(
            Arc::clone(&self.api),
            rtc_configuration(config),
            ops_rx,
            emitter,
        ));

        Ok(WebRtcConnection { ops: ops_tx })
    }
}

/// Handle to a connection task. Dropping it closes the connection.
#[derive(Debug)]
pub struct WebRtcConnection {
    ops: mpsc::UnboundedSender<PeerOp>,
}

impl PeerConnection for WebRtcConnection {
    fn execute(&self, op: PeerOp) {
        if self.ops.send(op).is_err() {
            debug!("Peer connection task already finished");
        }
    }
}

#[derive(Clone)]
struct Emitter {
    peer: PeerId,
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<PeerSignal>,
}

impl Emitter {
    fn emit(&self, event: PeerEvent) {
        let signal = PeerSignal::new(self.peer.clone(), self.connection, event);
        if self.tx.send(signal).is_err() {
            debug!(peer = %self.peer.short(), "Signal receiver gone");
        }
    }
}

fn rtc_configuration(config: &ConnectionConfig) -> RTCConfiguration {
    if !config.pc_constraints.is_null() {
        debug!(constraints = %config.pc_constraints, "Peer connection constraints");
    }
    RTCConfiguration {
        ice_servers: config.ice.ice_servers.iter().map(rtc_ice_server).collect(),
        ..Default::default()
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

async fn run_peer(
    api: Arc<API>,
    config: RTCConfiguration,
    mut ops: mpsc::UnboundedReceiver<PeerOp>,
    emitter: Emitter,
) {
    let pc = match api.new_peer_connection(config).await {
        Ok(pc) => Arc::new(pc),
        Err(e) => {
            warn!(peer = %emitter.peer.short(), error = %e, "Failed to create peer connection");
            emitter.emit(PeerEvent::Failed(NegotiationError::PeerConnection(e.to_string())));
            return;
        }
    };

    let channels: Channels = Arc::new(Mutex::new(HashMap::new()));
    install_callbacks(&pc, &emitter, &channels);

    let mut peer = PeerTask {
        pc: Arc::clone(&pc),
        channels,
        emitter: emitter.clone(),
        kinds: HashSet::new(),
    };

    while let Some(op) = ops.recv().await {
        let closing = op == PeerOp::Close;
        if let Err(e) = peer.apply(op).await {
            warn!(peer = %emitter.peer.short(), error = %e, "Peer operation failed");
            emitter.emit(PeerEvent::Failed(e));
        }
        if closing {
            break;
        }
    }

    if let Err(e) = pc.close().await {
        debug!(peer = %emitter.peer.short(), error = %e, "Error while closing peer connection");
    }
    info!(peer = %emitter.peer.short(), connection = %emitter.connection, "Peer connection closed");
}

struct PeerTask {
    pc: Arc<RTCPeerConnection>,
    channels: Channels,
    emitter: Emitter,
    /// Kinds that already have a sending track or a receive transceiver
    kinds: HashSet<TrackKind>,
}

impl PeerTask {
    async fn apply(&mut self, op: PeerOp) -> Result<(), NegotiationError> {
        match op {
            PeerOp::CreateOffer { constraints } => {
                self.add_receive_transceivers(&constraints).await?;
                let offer = self
                    .pc
                    .create_offer(None)
                    .await
                    .map_err(|e| NegotiationError::CreateOffer(e.to_string()))?;
                self.emitter
                    .emit(PeerEvent::OfferCreated(SessionDescription::offer(offer.sdp)));
            }
            PeerOp::CreateAnswer { .. } => {
                let answer = self
                    .pc
                    .create_answer(None)
                    .await
                    .map_err(|e| NegotiationError::CreateAnswer(e.to_string()))?;
                self.emitter
                    .emit(PeerEvent::AnswerCreated(SessionDescription::answer(answer.sdp)));
            }
            PeerOp::SetLocalDescription(desc) => {
                let rtc = to_rtc_description(&desc)?;
                self.pc
                    .set_local_description(rtc)
                    .await
                    .map_err(|e| NegotiationError::SetLocalDescription(e.to_string()))?;
                self.emitter.emit(PeerEvent::LocalDescriptionSet(desc));
            }
            PeerOp::SetRemoteDescription(desc) => {
                let rtc = to_rtc_description(&desc)?;
                self.pc
                    .set_remote_description(rtc)
                    .await
                    .map_err(|e| NegotiationError::SetRemoteDescription(e.to_string()))?;
                self.emitter.emit(PeerEvent::RemoteDescriptionSet(desc.kind));
            }
            PeerOp::AddIceCandidate(candidate) => {
                let init = RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    ..Default::default()
                };
                self.pc
                    .add_ice_candidate(init)
                    .await
                    .map_err(|e| NegotiationError::AddIceCandidate(e.to_string()))?;
            }
            PeerOp::AddStream(stream) => {
                for kind in &stream.tracks {
                    let track = Arc::new(TrackLocalStaticSample::new(
                        codec_for(*kind),
                        format!("{}-{}", stream.id, kind_name(*kind)),
                        stream.id.clone(),
                    ));
                    self.pc
                        .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                        .await
                        .map_err(|e| NegotiationError::PeerConnection(e.to_string()))?;
                    self.kinds.insert(*kind);
                }
                debug!(peer = %self.emitter.peer.short(), stream = %stream.id, "Attached local stream");
            }
            PeerOp::CreateDataChannel { label } => match self.pc.create_data_channel(&label, None).await {
                Ok(dc) => {
                    wire_channel(dc, false, self.emitter.clone(), Arc::clone(&self.channels)).await;
                }
                Err(e) => self.channel_failed(label, e),
            },
            PeerOp::SendData { label, text } => {
                let dc = self.channels.lock().await.get(&label).cloned();
                let Some(dc) = dc else {
                    warn!(channel = %label, "No data channel to send on");
                    return Ok(());
                };
                if let Err(e) = dc.send_text(text).await {
                    self.channel_failed(label, e);
                }
            }
            PeerOp::CloseDataChannel { label, after } => {
                let channels = Arc::clone(&self.channels);
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let dc = channels.lock().await.remove(&label);
                    if let Some(dc) = dc {
                        if let Err(e) = dc.close().await {
                            debug!(channel = %label, error = %e, "Data channel close failed");
                        }
                    }
                });
            }
            PeerOp::Close => {
                self.channels.lock().await.clear();
            }
        }
        Ok(())
    }

    /// Data channel failures concern one transfer, not the whole connection.
    fn channel_failed(&self, label: String, error: webrtc::Error) {
        warn!(peer = %self.emitter.peer.short(), channel = %label, error = %error, "Data channel operation failed");
        self.emitter.emit(PeerEvent::DataChannelError {
            label,
            reason: error.to_string(),
        });
    }

    /// Receive-only transceivers for kinds requested by the constraints but
    /// not sent locally.
    async fn add_receive_transceivers(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<(), NegotiationError> {
        let wanted = [
            (TrackKind::Audio, constraints.offer_to_receive_audio()),
            (TrackKind::Video, constraints.offer_to_receive_video()),
        ];
        for (kind, requested) in wanted {
            if !requested || self.kinds.contains(&kind) {
                continue;
            }
            let init = RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            };
            self.pc
                .add_transceiver_from_kind(codec_type(kind), Some(init))
                .await
                .map_err(|e| NegotiationError::CreateOffer(e.to_string()))?;
            self.kinds.insert(kind);
        }
        Ok(())
    }
}

fn install_callbacks(pc: &Arc<RTCPeerConnection>, emitter: &Emitter, channels: &Channels) {
    let tx = emitter.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                tx.emit(PeerEvent::LocalCandidate(None));
                return;
            };
            match candidate.to_json() {
                Ok(init) => tx.emit(PeerEvent::LocalCandidate(Some(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                }))),
                Err(e) => warn!(error = %e, "Failed to serialize ICE candidate"),
            }
        })
    }));

    let tx = emitter.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(state) = ice_connection_state(state) {
                tx.emit(PeerEvent::IceConnectionState(state));
            }
        })
    }));

    let tx = emitter.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(state) = gathering_state(state) {
                tx.emit(PeerEvent::IceGatheringState(state));
            }
        })
    }));

    let tx = emitter.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(state) = signaling_state(state) {
                tx.emit(PeerEvent::SignalingState(state));
            }
        })
    }));

    let tx = emitter.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                tx.emit(PeerEvent::RemoteStream(RemoteStream {
                    stream_id: track.stream_id(),
                    track_id: track.id(),
                    kind,
                }));
            })
        },
    ));

    let tx = emitter.clone();
    let channels = Arc::clone(channels);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        let channels = Arc::clone(&channels);
        Box::pin(async move {
            debug!(peer = %tx.peer.short(), channel = %dc.label(), "Remote data channel announced");
            wire_channel(dc, true, tx, channels).await;
        })
    }));
}

async fn wire_channel(dc: Arc<RTCDataChannel>, remote: bool, emitter: Emitter, channels: Channels) {
    let label = dc.label().to_string();
    channels.lock().await.insert(label.clone(), Arc::clone(&dc));

    let (tx, open_label) = (emitter.clone(), label.clone());
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            tx.emit(PeerEvent::DataChannelOpen {
                label: open_label,
                remote,
            });
        })
    }));

    let (tx, msg_label) = (emitter.clone(), label.clone());
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        let label = msg_label.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => tx.emit(PeerEvent::DataChannelMessage { label, text }),
                Err(_) => warn!(channel = %label, "Ignoring binary data channel message"),
            }
        })
    }));

    let (tx, close_label) = (emitter.clone(), label.clone());
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        let label = close_label.clone();
        let channels = Arc::clone(&channels);
        Box::pin(async move {
            channels.lock().await.remove(&label);
            tx.emit(PeerEvent::DataChannelClosed { label });
        })
    }));

    let (tx, error_label) = (emitter, label);
    dc.on_error(Box::new(move |err: webrtc::Error| {
        let tx = tx.clone();
        let label = error_label.clone();
        Box::pin(async move {
            tx.emit(PeerEvent::DataChannelError {
                label,
                reason: err.to_string(),
            });
        })
    }));
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let result = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    };
    result.map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        ..Default::default()
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn kind_name(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

fn ice_connection_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn gathering_state(state: RTCIceGathererState) -> Option<CandidateGenerationState> {
    Some(match state {
        RTCIceGathererState::New => CandidateGenerationState::New,
        RTCIceGathererState::Gathering => CandidateGenerationState::Gathering,
        RTCIceGathererState::Complete => CandidateGenerationState::Complete,
        _ => return None,
    })
}

fn signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    Some(match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => return None,
    })
}
