use skyway_media::{JoinStep, PeerConnector};
use skyway_net::fetch_session;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, ClientSnapshot, Internal};
use crate::state::BootstrapTarget;

impl<C: PeerConnector> Bridge<C> {
    /// Reset readiness and fetch fresh credentials from `target`.
    pub(crate) fn init(&mut self, target: BootstrapTarget) {
        info!(server = %target.server, room = ?target.room, "Initialising session");
        self.state.target = Some(target);
        self.machine.reset_readiness();
        self.start_bootstrap();
    }

    pub(crate) fn start_bootstrap(&mut self) {
        let Some(target) = &self.state.target else {
            warn!("No bootstrap target, call init first");
            return;
        };
        let url = target.url();

        self.state.bootstrap_generation += 1;
        self.state.bootstrap_in_flight = true;
        let generation = self.state.bootstrap_generation;
        self.machine.begin_bootstrap();

        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = fetch_session(&url).await;
            if internal
                .send(Internal::Bootstrap { generation, result })
                .await
                .is_err()
            {
                debug!("Client task gone before bootstrap finished");
            }
        });
    }

    pub(crate) fn join_room(&mut self) -> JoinStep {
        let step = self.machine.join_room();
        match step {
            JoinStep::NeedBootstrap if self.state.bootstrap_in_flight => {
                debug!("Join waits for the running bootstrap");
            }
            JoinStep::NeedBootstrap if self.state.target.is_some() => self.start_bootstrap(),
            JoinStep::NeedBootstrap => info!("Join deferred until init"),
            JoinStep::NeedChannel => self.open_channel(),
            JoinStep::AlreadyJoining | JoinStep::Sent => {}
        }
        step
    }

    /// Leave the room and drop the signaling channel. Credentials must be
    /// fetched again before the next join.
    pub(crate) fn leave_room(&mut self) -> bool {
        if !self.machine.leave_room() {
            return false;
        }
        self.close_channel();
        self.machine.channel_closed();
        true
    }

    pub(crate) fn set_display_name(&mut self, name: String) {
        debug!(name = %name, "Display name set");
        self.machine.set_display_name(name);
    }

    pub(crate) fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            ready_state: self.machine.ready_state(),
            room_state: self.machine.room_state(),
            channel_open: self.machine.is_channel_open(),
            local_id: self.machine.local_id().cloned(),
            display_name: self.machine.display_name(),
            peers: self.machine.peer_ids(),
        }
    }
}
