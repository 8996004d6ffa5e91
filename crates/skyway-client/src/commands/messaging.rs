use serde_json::Value;
use skyway_media::PeerConnector;
use skyway_shared::types::{PeerId, RoomState};
use tracing::warn;

use crate::bridge::Bridge;

impl<C: PeerConnector> Bridge<C> {
    /// Broadcast `data` to the room, or send it to `target` only.
    pub(crate) fn send_chat(&mut self, data: Value, target: Option<PeerId>) {
        if self.machine.room_state() != RoomState::Inside {
            warn!("Chat message sent outside a room is only echoed locally");
        }
        self.machine.send_chat(data, target);
    }
}
