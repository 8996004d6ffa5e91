use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::ice::WirePcConfig;
use crate::types::{IceCandidate, PeerId, RoomId, SdpType, SessionDescription};

/// Discriminant of the bundle envelope that wraps several messages.
const GROUP_TYPE: &str = "group";

/// All signaling messages exchanged with the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Ask the relay to admit us to a room
    #[serde(rename = "joinRoom")]
    JoinRoom(JoinRoom),

    /// Relay confirmation that we are inside the room
    #[serde(rename = "inRoom")]
    InRoom(InRoom),

    /// Broadcast announcement of a newly entered participant
    #[serde(rename = "enter")]
    Enter(Enter),

    /// Unicast reply to `enter`; the receiver becomes the offerer
    #[serde(rename = "welcome")]
    Welcome(Welcome),

    /// SDP offer
    #[serde(rename = "offer")]
    Offer(SdpMessage),

    /// SDP answer
    #[serde(rename = "answer")]
    Answer(SdpMessage),

    /// Trickled ICE candidate
    #[serde(rename = "candidate")]
    Candidate(CandidateMessage),

    /// A participant left the room
    #[serde(rename = "bye")]
    Bye(Bye),

    /// Room or private chat message
    #[serde(rename = "chat")]
    Chat(Chat),

    /// Relay instruction to move away from the room
    #[serde(rename = "redirect")]
    Redirect(Redirect),

    #[serde(rename = "update_guest_name")]
    UpdateGuestName(Notice),

    #[serde(rename = "error")]
    Error(Notice),

    #[serde(rename = "invite")]
    Invite(Notice),

    #[serde(rename = "video_mute_event")]
    VideoMuteEvent(Notice),

    #[serde(rename = "roomLockEvent")]
    RoomLockEvent(Notice),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRoom {
    pub mid: PeerId,
    pub rid: RoomId,
    pub cid: String,
    #[serde(rename = "roomCred")]
    pub room_cred: String,
    #[serde(rename = "userCred")]
    pub user_cred: String,
    #[serde(rename = "tokenTempCreated")]
    pub token_temp_created: Value,
    #[serde(rename = "timeStamp")]
    pub time_stamp: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InRoom {
    #[serde(default)]
    pub pc_config: WirePcConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enter {
    pub mid: PeerId,
    pub rid: RoomId,
    #[serde(default)]
    pub nick: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub mid: PeerId,
    pub target: PeerId,
    pub rid: RoomId,
    #[serde(default)]
    pub nick: String,
}

/// Body of both `offer` and `answer`; the SDP kind is the envelope tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpMessage {
    pub sdp: String,
    pub mid: PeerId,
    pub target: PeerId,
    pub rid: RoomId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMessage {
    /// SDP m-line index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<u16>,
    /// SDP media id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub candidate: String,
    pub mid: PeerId,
    pub target: PeerId,
    pub rid: RoomId,
}

impl CandidateMessage {
    pub fn to_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: self.candidate.clone(),
            sdp_mid: self.id.clone(),
            sdp_mline_index: self.label,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bye {
    pub mid: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<RoomId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    #[serde(default)]
    pub cid: String,
    pub data: Value,
    pub mid: PeerId,
    #[serde(default)]
    pub nick: String,
    pub rid: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectAction {
    Warning,
    Reject,
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redirect {
    pub action: RedirectAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<RoomId>,
}

/// Relay notice we recognise but do not act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<PeerId>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Wire discriminant of this envelope
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "joinRoom",
            Self::InRoom(_) => "inRoom",
            Self::Enter(_) => "enter",
            Self::Welcome(_) => "welcome",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
            Self::Bye(_) => "bye",
            Self::Chat(_) => "chat",
            Self::Redirect(_) => "redirect",
            Self::UpdateGuestName(_) => "update_guest_name",
            Self::Error(_) => "error",
            Self::Invite(_) => "invite",
            Self::VideoMuteEvent(_) => "video_mute_event",
            Self::RoomLockEvent(_) => "roomLockEvent",
        }
    }

    /// The `mid` field, if the message carries one
    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            Self::JoinRoom(m) => Some(&m.mid),
            Self::InRoom(m) => m.mid.as_ref(),
            Self::Enter(m) => Some(&m.mid),
            Self::Welcome(m) => Some(&m.mid),
            Self::Offer(m) | Self::Answer(m) => Some(&m.mid),
            Self::Candidate(m) => Some(&m.mid),
            Self::Bye(m) => Some(&m.mid),
            Self::Chat(m) => Some(&m.mid),
            Self::Redirect(m) => m.mid.as_ref(),
            Self::UpdateGuestName(n)
            | Self::Error(n)
            | Self::Invite(n)
            | Self::VideoMuteEvent(n)
            | Self::RoomLockEvent(n) => n.mid.as_ref(),
        }
    }

    /// Unicast target, `None` for broadcasts
    pub fn target(&self) -> Option<&PeerId> {
        match self {
            Self::Welcome(m) => Some(&m.target),
            Self::Offer(m) | Self::Answer(m) => Some(&m.target),
            Self::Candidate(m) => Some(&m.target),
            Self::Chat(m) => m.target.as_ref(),
            _ => None,
        }
    }

    /// Types still processed when they originate from ourselves.
    pub fn accepts_self_origin(&self) -> bool {
        matches!(self, Self::Redirect(_) | Self::InRoom(_) | Self::Chat(_))
    }

    /// Build an `offer` or `answer` envelope from a local description.
    pub fn description(
        desc: &SessionDescription,
        mid: PeerId,
        target: PeerId,
        rid: RoomId,
    ) -> Self {
        let body = SdpMessage {
            sdp: desc.sdp.clone(),
            mid,
            target,
            rid,
        };
        match desc.kind {
            SdpType::Offer => Self::Offer(body),
            SdpType::Answer => Self::Answer(body),
        }
    }
}

/// One decoded signaling payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Single(Envelope),
    Group(Vec<Envelope>),
}

impl Frame {
    /// Flatten into the envelopes to dispatch, in list order.
    pub fn into_envelopes(self) -> Vec<Envelope> {
        match self {
            Self::Single(envelope) => vec![envelope],
            Self::Group(list) => list,
        }
    }
}

#[derive(Serialize)]
struct GroupRef<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    lists: &'a [Envelope],
}

/// Serialize an envelope to its JSON text form
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Serialize several envelopes as one `group` bundle
pub fn encode_group(envelopes: &[Envelope]) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(&GroupRef {
        kind: GROUP_TYPE,
        lists: envelopes,
    })?)
}

/// Decode a signaling payload. Groups are unwrapped one level only; a group
/// nested inside a group is rejected.
pub fn decode(payload: &[u8]) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_slice(payload)?;

    let is_group = value.get("type").and_then(Value::as_str) == Some(GROUP_TYPE);
    if !is_group {
        return Ok(Frame::Single(serde_json::from_value(value)?));
    }

    #[derive(Deserialize)]
    struct Group {
        lists: Vec<Envelope>,
    }

    let group: Group = serde_json::from_value(value)?;
    Ok(Frame::Group(group.lists))
}
