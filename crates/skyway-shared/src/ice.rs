//! ICE server configuration handed down by the signaling relay.
//!
//! The relay describes servers in the legacy single-`url` form, with TURN
//! credentials sometimes embedded as `turn:user@host:port`. Peer
//! connection backends want a list of URLs plus separate credentials, so
//! [`normalize_ice_servers`] rewrites the list once when the room is joined.

use serde::{Deserialize, Serialize};

/// ICE server entry as it appears on the wire in `inRoom.pc_config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireIceServer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// `pc_config` object of the `inRoom` envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePcConfig {
    #[serde(rename = "iceServers", default)]
    pub ice_servers: Vec<WireIceServer>,
}

/// Normalised ICE server, ready for a peer connection backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
}

/// Rewrite relay-provided servers into backend form.
///
/// STUN entries keep their URL. TURN entries carrying `user@host` have the
/// user moved into `username`. Entries without any URL are skipped.
pub fn normalize_ice_servers(servers: &[WireIceServer]) -> Vec<IceServer> {
    let mut out = Vec::with_capacity(servers.len());

    for server in servers {
        let mut urls: Vec<String> = server.urls.clone();
        if let Some(url) = &server.url {
            urls.insert(0, url.clone());
        }
        if urls.is_empty() {
            tracing::warn!("Skipping ICE server without URL");
            continue;
        }

        let mut username = server.username.clone().unwrap_or_default();
        let urls = urls
            .into_iter()
            .map(|url| match split_embedded_user(&url) {
                Some((user, stripped)) => {
                    if username.is_empty() {
                        username = user;
                    }
                    stripped
                }
                None => url,
            })
            .collect();

        out.push(IceServer {
            urls,
            username,
            credential: server.credential.clone().unwrap_or_default(),
        });
    }

    out
}

impl From<&WirePcConfig> for IceConfig {
    fn from(wire: &WirePcConfig) -> Self {
        Self {
            ice_servers: normalize_ice_servers(&wire.ice_servers),
        }
    }
}

/// `turn:alice@relay.example.org:3478` -> (`alice`, `turn:relay.example.org:3478`)
fn split_embedded_user(url: &str) -> Option<(String, String)> {
    let (scheme, rest) = url.split_once(':')?;
    if scheme == "stun" || scheme == "stuns" {
        return None;
    }
    let (user, host) = rest.split_once('@')?;
    Some((user.to_string(), format!("{scheme}:{host}")))
}
