//! Client actor.
//!
//! One tokio task owns the [`SignalingMachine`] and serialises everything
//! that touches it: API commands, signaling channel notifications, peer
//! connection signals and bootstrap completions. After each input the
//! machine's outbox is flushed to the signaling channel.

use bytes::Bytes;
use serde_json::Value;
use skyway_media::{JoinStep, PeerConnector, PeerSignal, SignalingMachine};
use skyway_net::{spawn_signaling, ChannelCommand, ChannelNotification};
use skyway_shared::constants::CHANNEL_CAPACITY;
use skyway_shared::data_message::FileInfo;
use skyway_shared::error::{BootstrapError, MediaAccessError, TransferError};
use skyway_shared::events::EventBus;
use skyway_shared::protocol;
use skyway_shared::session::Credentials;
use skyway_shared::types::{LocalStream, PeerId, ReadyState, RoomState};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::state::{BootstrapTarget, ClientState};

/// Commands sent *into* the client task.
#[derive(Debug)]
pub enum ClientCommand {
    Init {
        target: BootstrapTarget,
        reply: oneshot::Sender<()>,
    },
    JoinRoom {
        reply: oneshot::Sender<JoinStep>,
    },
    LeaveRoom {
        reply: oneshot::Sender<bool>,
    },
    SendChat {
        data: Value,
        target: Option<PeerId>,
        reply: oneshot::Sender<()>,
    },
    SendFile {
        file: FileInfo,
        data: Bytes,
        target: Option<PeerId>,
        reply: oneshot::Sender<Result<String, TransferError>>,
    },
    AddLocalStream {
        stream: LocalStream,
        reply: oneshot::Sender<()>,
    },
    MediaAccessFailed {
        error: MediaAccessError,
        reply: oneshot::Sender<()>,
    },
    SetDisplayName {
        name: String,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<ClientSnapshot>,
    },
    /// Leave the room and stop the task.
    Shutdown,
}

/// Point-in-time view of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub ready_state: ReadyState,
    pub room_state: RoomState,
    pub channel_open: bool,
    pub local_id: Option<PeerId>,
    pub display_name: String,
    pub peers: Vec<PeerId>,
}

/// Results of side tasks, fed back into the actor.
#[derive(Debug)]
pub(crate) enum Internal {
    Bootstrap {
        generation: u64,
        result: Result<Credentials, BootstrapError>,
    },
    Channel {
        generation: u64,
        notification: ChannelNotification,
    },
}

pub(crate) struct Bridge<C: PeerConnector> {
    pub(crate) machine: SignalingMachine<C>,
    pub(crate) state: ClientState,
    pub(crate) internal_tx: mpsc::Sender<Internal>,
}

/// Spawn the client task. Returns the command sender.
pub fn spawn_bridge<C>(
    connector: C,
    events: EventBus,
    state: ClientState,
    display_name: Option<String>,
    peer_signals: mpsc::UnboundedReceiver<PeerSignal>,
) -> mpsc::Sender<ClientCommand>
where
    C: PeerConnector + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel::<ClientCommand>(CHANNEL_CAPACITY);
    let (internal_tx, internal_rx) = mpsc::channel::<Internal>(CHANNEL_CAPACITY);

    let mut machine = SignalingMachine::new(connector, events);
    if let Some(name) = display_name {
        machine.set_display_name(name);
    }
    let bridge = Bridge {
        machine,
        state,
        internal_tx,
    };
    tokio::spawn(bridge.run(cmd_rx, internal_rx, peer_signals));

    cmd_tx
}

impl<C: PeerConnector> Bridge<C> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ClientCommand>,
        mut internal_rx: mpsc::Receiver<Internal>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerSignal>,
    ) {
        info!("Client bridge started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ClientCommand::Shutdown) => {
                            info!("Client shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            // All handles dropped
                            info!("Command channel closed, shutting down client");
                            break;
                        }
                    }
                }

                Some(internal) = internal_rx.recv() => self.handle_internal(internal),

                Some(signal) = peer_rx.recv() => self.machine.handle_peer_event(signal),
            }

            self.flush();
        }

        self.leave_room();
        info!("Client bridge terminated");
    }

    fn handle_command(&mut self, cmd: ClientCommand) {
        match cmd {
            ClientCommand::Init { target, reply } => {
                self.init(target);
                let _ = reply.send(());
            }
            ClientCommand::JoinRoom { reply } => {
                let _ = reply.send(self.join_room());
            }
            ClientCommand::LeaveRoom { reply } => {
                let _ = reply.send(self.leave_room());
            }
            ClientCommand::SendChat {
                data,
                target,
                reply,
            } => {
                self.send_chat(data, target);
                let _ = reply.send(());
            }
            ClientCommand::SendFile {
                file,
                data,
                target,
                reply,
            } => {
                let _ = reply.send(self.send_file(file, data, target));
            }
            ClientCommand::AddLocalStream { stream, reply } => {
                self.add_local_stream(stream);
                let _ = reply.send(());
            }
            ClientCommand::MediaAccessFailed { error, reply } => {
                self.media_access_failed(error);
                let _ = reply.send(());
            }
            ClientCommand::SetDisplayName { name, reply } => {
                self.set_display_name(name);
                let _ = reply.send(());
            }
            ClientCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ClientCommand::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Bootstrap { generation, result } => {
                if generation != self.state.bootstrap_generation {
                    debug!(generation, "Ignoring stale bootstrap result");
                    return;
                }
                self.state.bootstrap_in_flight = false;
                if self.machine.complete_bootstrap(result) {
                    self.open_channel();
                }
            }
            Internal::Channel {
                generation,
                notification,
            } => {
                if generation != self.state.channel_generation {
                    debug!(generation, "Ignoring notification from a previous channel");
                    return;
                }
                match notification {
                    ChannelNotification::Opened => self.machine.channel_opened(),
                    ChannelNotification::Message(payload) => self.machine.handle_payload(&payload),
                    ChannelNotification::Error(reason) => self.machine.channel_error(&reason),
                    ChannelNotification::Closed => {
                        self.state.channel = None;
                        self.machine.channel_closed();
                    }
                }
            }
        }
    }

    /// Spawn the signaling task for the relay named in the credentials.
    pub(crate) fn open_channel(&mut self) {
        if self.state.channel.is_some() {
            debug!("Signaling channel already opening");
            return;
        }
        let Some(url) = self.machine.signaling_url() else {
            warn!("No signaling endpoint known yet");
            return;
        };

        self.state.channel_generation += 1;
        let generation = self.state.channel_generation;
        info!(url = %url, generation, "Opening signaling channel");

        let (cmd_tx, mut notif_rx) = spawn_signaling(url);
        self.state.channel = Some(cmd_tx);

        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(notification) = notif_rx.recv().await {
                let msg = Internal::Channel {
                    generation,
                    notification,
                };
                if internal.send(msg).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Stop the current signaling task and ignore anything it still reports.
    pub(crate) fn close_channel(&mut self) {
        self.state.channel_generation += 1;
        if let Some(tx) = self.state.channel.take() {
            if tx.send(ChannelCommand::Close).is_err() {
                debug!("Signaling task already gone");
            }
        }
    }

    fn flush(&mut self) {
        let outgoing = self.machine.take_outgoing();
        if outgoing.is_empty() {
            return;
        }
        let Some(tx) = &self.state.channel else {
            debug!(count = outgoing.len(), "No signaling channel, dropping outgoing messages");
            return;
        };

        for envelope in outgoing {
            match protocol::encode(&envelope) {
                Ok(text) => {
                    if tx.send(ChannelCommand::Send(text)).is_err() {
                        warn!("Signaling task gone, dropping outgoing messages");
                        return;
                    }
                }
                Err(e) => warn!(kind = envelope.kind(), error = %e, "Failed to encode envelope"),
            }
        }
    }
}
