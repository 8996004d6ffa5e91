use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::DEFAULT_SIGNALING_PORT;
use crate::error::BootstrapError;
use crate::ice::IceConfig;
use crate::types::{LocalStream, PeerId, ReadyState, RoomId};

const OFFER_TO_RECEIVE_AUDIO: &str = "OfferToReceiveAudio";
const OFFER_TO_RECEIVE_VIDEO: &str = "OfferToReceiveVideo";
const VENDOR_PREFIX: &str = "Moz";

/// `{mandatory: {...}, optional: [...]}` constraint object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    #[serde(default)]
    pub mandatory: Map<String, Value>,
    #[serde(default)]
    pub optional: Vec<Value>,
}

impl MediaConstraints {
    /// Constraints that ask the remote side for audio and video.
    pub fn receive_all() -> Self {
        let mut mandatory = Map::new();
        mandatory.insert(OFFER_TO_RECEIVE_AUDIO.into(), Value::Bool(true));
        mandatory.insert(OFFER_TO_RECEIVE_VIDEO.into(), Value::Bool(true));
        Self {
            mandatory,
            optional: Vec::new(),
        }
    }

    /// Offer constraints with vendor-prefixed keys removed and `sdp` merged
    /// on top. The inputs are left untouched.
    pub fn merged(offer: &Self, sdp: &Self) -> Self {
        let mut mandatory: Map<String, Value> = offer
            .mandatory
            .iter()
            .filter(|(key, _)| !key.contains(VENDOR_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in &sdp.mandatory {
            mandatory.insert(key.clone(), value.clone());
        }

        let mut optional = offer.optional.clone();
        optional.extend(sdp.optional.iter().cloned());

        Self { mandatory, optional }
    }

    pub fn offer_to_receive_audio(&self) -> bool {
        self.flag(OFFER_TO_RECEIVE_AUDIO)
    }

    pub fn offer_to_receive_video(&self) -> bool {
        self.flag(OFFER_TO_RECEIVE_VIDEO)
    }

    fn flag(&self, key: &str) -> bool {
        self.mandatory.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NegotiationConfig {
    pub ice: IceConfig,
    pub pc_constraints: Value,
    pub offer_constraints: MediaConstraints,
    pub sdp_constraints: MediaConstraints,
}

impl NegotiationConfig {
    /// Constraints passed to `CreateOffer`
    pub fn offer(&self) -> MediaConstraints {
        MediaConstraints::merged(&self.offer_constraints, &self.sdp_constraints)
    }

    /// Constraints passed to `CreateAnswer`
    pub fn answer(&self) -> MediaConstraints {
        self.sdp_constraints.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub id: PeerId,
    pub display_name: String,
    pub credential: String,
    pub credential_created: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomInfo {
    pub id: RoomId,
    pub credential: String,
    pub credential_timestamp: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEndpoint {
    pub host: String,
    pub port: u16,
}

impl SignalingEndpoint {
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Everything the bootstrap endpoint hands out for one session
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub cid: String,
    pub user: UserInfo,
    pub room: RoomInfo,
    pub signaling: SignalingEndpoint,
    pub negotiation: NegotiationConfig,
}

/// Raw bootstrap response body
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapResponse {
    pub cid: String,
    pub username: String,
    #[serde(rename = "userCred")]
    pub user_cred: String,
    #[serde(rename = "tokenTempCreated", default)]
    pub token_temp_created: Value,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    pub room_key: String,
    #[serde(rename = "roomCred")]
    pub room_cred: String,
    #[serde(rename = "timeStamp", default)]
    pub time_stamp: Value,
    #[serde(rename = "ipSigserver")]
    pub ip_sigserver: String,
    #[serde(rename = "portSigserver", default)]
    pub port_sigserver: Value,
    pub pc_constraints: String,
    pub offer_constraints: String,
}

impl TryFrom<BootstrapResponse> for Credentials {
    type Error = BootstrapError;

    fn try_from(raw: BootstrapResponse) -> Result<Self, Self::Error> {
        let port = parse_port(&raw.port_sigserver)?;
        let pc_constraints: Value = serde_json::from_str(&raw.pc_constraints)?;
        let offer_constraints: MediaConstraints = serde_json::from_str(&raw.offer_constraints)?;

        Ok(Self {
            cid: raw.cid,
            user: UserInfo {
                id: PeerId(raw.username),
                display_name: raw.display_name,
                credential: raw.user_cred,
                credential_created: raw.token_temp_created,
            },
            room: RoomInfo {
                id: RoomId(raw.room_key),
                credential: raw.room_cred,
                credential_timestamp: raw.time_stamp,
            },
            signaling: SignalingEndpoint {
                host: raw.ip_sigserver,
                port,
            },
            negotiation: NegotiationConfig {
                ice: IceConfig::default(),
                pc_constraints,
                offer_constraints,
                sdp_constraints: MediaConstraints::receive_all(),
            },
        })
    }
}

impl Credentials {
    /// Parse a bootstrap response body
    pub fn from_json(body: &[u8]) -> Result<Self, BootstrapError> {
        let raw: BootstrapResponse = serde_json::from_slice(body)
            .map_err(|e| BootstrapError::InvalidResponse(e.to_string()))?;
        Self::try_from(raw)
    }
}

/// The port is sent as a number by some deployments and as a string by others.
fn parse_port(value: &Value) -> Result<u16, BootstrapError> {
    match value {
        Value::Null => Ok(DEFAULT_SIGNALING_PORT),
        Value::Number(n) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| BootstrapError::InvalidResponse(format!("invalid port {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| BootstrapError::InvalidResponse(format!("invalid port {s:?}"))),
        other => Err(BootstrapError::InvalidResponse(format!("invalid port {other}"))),
    }
}

/// Per-client session state
#[derive(Debug, Clone)]
pub struct Session {
    pub ready_state: ReadyState,
    pub credentials: Option<Credentials>,
    pub local_streams: Vec<LocalStream>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            ready_state: ReadyState::Uninitialized,
            credentials: None,
            local_streams: Vec::new(),
        }
    }
}

impl Session {
    pub fn is_ready(&self) -> bool {
        self.ready_state == ReadyState::Ready && self.credentials.is_some()
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.credentials.as_ref().map(|c| &c.user.id)
    }
}
