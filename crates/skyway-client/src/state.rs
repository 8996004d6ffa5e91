//! State the client actor keeps next to the signaling machine.
//!
//! The machine owns everything protocol related. [`ClientState`] only tracks
//! the side tasks the actor drives for it: the bootstrap fetch and the
//! signaling channel.

use skyway_net::bootstrap::bootstrap_url;
use skyway_net::ChannelCommand;
use tokio::sync::mpsc;

/// Where credentials are fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapTarget {
    pub server: String,
    pub api_key: String,
    /// Defaults to the API key when `None`
    pub room: Option<String>,
}

impl BootstrapTarget {
    pub fn url(&self) -> String {
        bootstrap_url(&self.server, &self.api_key, self.room.as_deref())
    }
}

#[derive(Debug, Default)]
pub struct ClientState {
    /// Set by `init`. `None` until then.
    pub target: Option<BootstrapTarget>,

    /// Bumped on every fetch; older completions are ignored.
    pub bootstrap_generation: u64,

    pub bootstrap_in_flight: bool,

    /// Command sender of the live signaling task.
    pub channel: Option<mpsc::UnboundedSender<ChannelCommand>>,

    /// Bumped when a channel is opened or abandoned, so notifications from
    /// an earlier socket are ignored.
    pub channel_generation: u64,
}

impl ClientState {
    pub fn new(target: Option<BootstrapTarget>) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }
}
