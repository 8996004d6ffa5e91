pub mod bridge;
pub mod commands;
pub mod state;

use bytes::Bytes;
use serde_json::Value;
use skyway_media::{JoinStep, PeerConnector, PeerSignal, WebRtcConnector};
use skyway_shared::data_message::FileInfo;
use skyway_shared::error::{MediaAccessError, SkywayError, TransferError};
use skyway_shared::events::{Event, EventBus, EventKind, Flow, HandlerId};
use skyway_shared::types::{LocalStream, PeerId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::{fmt, EnvFilter};

pub use crate::bridge::{ClientCommand, ClientSnapshot};
pub use crate::commands::files::load_file;
pub use crate::state::BootstrapTarget;

use crate::bridge::spawn_bridge;
use crate::state::ClientState;

/// Bootstrap server used when none is configured
pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8018/api/";

/// Filter applied when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str =
    "skyway_client=debug,skyway_media=debug,skyway_net=info,skyway_shared=info,warn";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Skyway(#[from] SkywayError),

    #[error("Failed to set up the WebRTC backend: {0}")]
    WebRtc(String),

    #[error("Client task has stopped")]
    Stopped,
}

impl From<TransferError> for ClientError {
    fn from(e: TransferError) -> Self {
        Self::Skyway(e.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server: String,
    /// Without a key the client waits for an explicit `init`
    pub api_key: Option<String>,
    pub room: Option<String>,
    pub display_name: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            api_key: None,
            room: None,
            display_name: None,
        }
    }
}

impl ClientConfig {
    pub fn target(&self) -> Option<BootstrapTarget> {
        self.api_key.as_ref().map(|key| BootstrapTarget {
            server: self.server.clone(),
            api_key: key.clone(),
            room: self.room.clone(),
        })
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` wins over
/// `default_filter`. Calling it twice is harmless.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Handle to a running client. Cheap to clone; every clone talks to the
/// same task.
#[derive(Debug, Clone)]
pub struct SkywayClient {
    commands: mpsc::Sender<ClientCommand>,
    events: EventBus,
}

impl SkywayClient {
    /// Start a client backed by webrtc-rs. Must be called inside a tokio
    /// runtime.
    pub fn spawn(config: ClientConfig) -> Result<Self, ClientError> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let connector =
            WebRtcConnector::new(signal_tx).map_err(|e| ClientError::WebRtc(e.to_string()))?;
        Ok(Self::spawn_with(connector, signal_rx, config))
    }

    /// Start a client on a custom peer backend. `peer_signals` must carry the
    /// signals produced by the connections `connector` opens.
    pub fn spawn_with<C>(
        connector: C,
        peer_signals: mpsc::UnboundedReceiver<PeerSignal>,
        config: ClientConfig,
    ) -> Self
    where
        C: PeerConnector + Send + 'static,
    {
        let events = EventBus::new();
        let state = ClientState::new(config.target());
        let commands = spawn_bridge(
            connector,
            events.clone(),
            state,
            config.display_name,
            peer_signals,
        );
        Self { commands, events }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ClientCommand,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    /// Fetch credentials for `room` (the API key's room when `None`).
    /// Readiness goes back to uninitialised first, then loading.
    pub async fn init(
        &self,
        server: &str,
        api_key: &str,
        room: Option<&str>,
    ) -> Result<(), ClientError> {
        let target = BootstrapTarget {
            server: server.to_string(),
            api_key: api_key.to_string(),
            room: room.map(str::to_string),
        };
        self.request(|reply| ClientCommand::Init { target, reply })
            .await
    }

    pub async fn join_room(&self) -> Result<JoinStep, ClientError> {
        self.request(|reply| ClientCommand::JoinRoom { reply }).await
    }

    /// Returns `false` when the client was not in a room.
    pub async fn leave_room(&self) -> Result<bool, ClientError> {
        self.request(|reply| ClientCommand::LeaveRoom { reply }).await
    }

    /// Send `data` to the room, or privately to `target`.
    pub async fn send_chat(&self, data: Value, target: Option<PeerId>) -> Result<(), ClientError> {
        self.request(|reply| ClientCommand::SendChat {
            data,
            target,
            reply,
        })
        .await
    }

    /// Send a file to every connected peer, or to `target` only. Returns the
    /// item id.
    pub async fn send_file(
        &self,
        file: FileInfo,
        data: Bytes,
        target: Option<PeerId>,
    ) -> Result<String, ClientError> {
        let result = self
            .request(|reply| ClientCommand::SendFile {
                file,
                data,
                target,
                reply,
            })
            .await?;
        Ok(result?)
    }

    pub async fn add_local_stream(&self, stream: LocalStream) -> Result<(), ClientError> {
        self.request(|reply| ClientCommand::AddLocalStream { stream, reply })
            .await
    }

    pub async fn media_access_failed(&self, error: MediaAccessError) -> Result<(), ClientError> {
        self.request(|reply| ClientCommand::MediaAccessFailed { error, reply })
            .await
    }

    pub async fn set_display_name(&self, name: impl Into<String>) -> Result<(), ClientError> {
        let name = name.into();
        self.request(|reply| ClientCommand::SetDisplayName { name, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<ClientSnapshot, ClientError> {
        self.request(|reply| ClientCommand::Snapshot { reply }).await
    }

    /// Leave the room if needed and stop the client task.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.commands
            .send(ClientCommand::Shutdown)
            .await
            .map_err(|_| ClientError::Stopped)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> Flow + Send + Sync + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    /// Subscribe by wire name (`"peerJoined"`, ...). Unknown names give `None`.
    pub fn on_named<F>(&self, name: &str, handler: F) -> Option<HandlerId>
    where
        F: Fn(&Event) -> Flow + Send + Sync + 'static,
    {
        self.events.subscribe_named(name, handler)
    }

    /// Remove one handler, or all handlers of `kind` when `id` is `None`.
    pub fn off(&self, kind: EventKind, id: Option<HandlerId>) {
        self.events.unsubscribe(kind, id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::routing::get;
    use axum::Router;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use skyway_media::mock::MockConnector;
    use skyway_shared::types::{ReadyState, RoomId, RoomState};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;

    type Clients = Arc<tokio::sync::Mutex<HashMap<usize, (Option<String>, mpsc::UnboundedSender<String>)>>>;

    /// Minimal room relay: answers `joinRoom` with `inRoom`, routes messages
    /// with a `target` to that peer and broadcasts the rest to everyone else.
    async fn spawn_relay() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let clients: Clients = Arc::default();

        tokio::spawn(async move {
            let mut next_conn = 0usize;
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                let conn = next_conn;
                next_conn += 1;
                let clients = Arc::clone(&clients);
                tokio::spawn(async move {
                    let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    let (mut write, mut read) = ws.split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                    clients.lock().await.insert(conn, (None, tx));

                    tokio::spawn(async move {
                        while let Some(text) = rx.recv().await {
                            if write.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    });

                    while let Some(Ok(Message::Text(text))) = read.next().await {
                        let msg: Value = serde_json::from_str(&text).unwrap();
                        let mut clients = clients.lock().await;
                        if msg["type"] == "joinRoom" {
                            let mid = msg["mid"].as_str().unwrap().to_string();
                            let reply = json!({
                                "type": "inRoom",
                                "rid": msg["rid"],
                                "mid": mid,
                                "pc_config": {"iceServers": [{"url": "stun:stun.example.org:3478"}]}
                            });
                            if let Some(entry) = clients.get_mut(&conn) {
                                entry.0 = Some(mid);
                                let _ = entry.1.send(reply.to_string());
                            }
                            continue;
                        }
                        let target = msg["target"].as_str().map(str::to_string);
                        for (id, (mid, tx)) in clients.iter() {
                            let deliver = match &target {
                                Some(t) => mid.as_deref() == Some(t.as_str()),
                                None => *id != conn,
                            };
                            if deliver {
                                let _ = tx.send(text.clone());
                            }
                        }
                    }
                    clients.lock().await.remove(&conn);
                });
            }
        });
        port
    }

    /// Bootstrap endpoint handing out a new user id per request.
    async fn spawn_bootstrap(relay_port: u16) -> String {
        let counter = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route(
            "/key/room/lobby",
            get(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    json!({
                        "cid": "key",
                        "username": format!("user-{n}"),
                        "userCred": "uc",
                        "tokenTempCreated": "2014-05-06T10:00:00Z",
                        "displayName": format!("Guest {n}"),
                        "room_key": "lobby",
                        "roomCred": "rc",
                        "timeStamp": "2014-05-06T10:00:00Z",
                        "ipSigserver": "127.0.0.1",
                        "portSigserver": relay_port,
                        "pc_constraints": "{\"optional\":[]}",
                        "offer_constraints": "{\"mandatory\":{},\"optional\":[]}"
                    })
                    .to_string()
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn config(server: &str) -> ClientConfig {
        ClientConfig {
            server: server.to_string(),
            api_key: Some("key".into()),
            room: Some("lobby".into()),
            display_name: None,
        }
    }

    /// Forward every event of `kinds` into a channel.
    fn record(client: &SkywayClient, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in kinds {
            let tx = tx.clone();
            client.on(*kind, move |event| {
                let _ = tx.send(event.clone());
                Flow::Continue
            });
        }
        rx
    }

    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<Event>, mut pred: F) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_config_target() {
        assert_eq!(ClientConfig::default().target(), None);
        let target = config("https://api.example.org/").target().unwrap();
        assert_eq!(target.url(), "https://api.example.org/key/room/lobby?client=native");
    }

    #[tokio::test]
    async fn test_send_file_outside_room() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let client = SkywayClient::spawn_with(MockConnector::new(), rx, ClientConfig::default());

        let file = FileInfo {
            name: "a.txt".into(),
            size: 3,
            item_type: "text/plain".into(),
        };
        let err = client
            .send_file(file, Bytes::from_static(b"abc"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Skyway(SkywayError::Transfer(TransferError::NotInRoom))
        ));
    }

    #[tokio::test]
    async fn test_join_without_init_waits() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let client = SkywayClient::spawn_with(MockConnector::new(), rx, ClientConfig::default());

        assert_eq!(client.join_room().await.unwrap(), JoinStep::NeedBootstrap);
        let snapshot = client.snapshot().await.unwrap();
        assert_eq!(snapshot.ready_state, ReadyState::Uninitialized);
        assert_eq!(snapshot.room_state, RoomState::Joining);
    }

    #[tokio::test]
    async fn test_failed_bootstrap_resets_readiness() {
        let app = Router::new().route(
            "/key/room/lobby",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (_tx, rx) = mpsc::unbounded_channel();
        let client = SkywayClient::spawn_with(MockConnector::new(), rx, ClientConfig::default());
        let mut events = record(&client, &[EventKind::ReadyStateChange]);

        client
            .init(&format!("http://{addr}/"), "key", Some("lobby"))
            .await
            .unwrap();

        let mut states = Vec::new();
        for _ in 0..3 {
            if let Event::ReadyStateChange(state) = wait_for(&mut events, |_| true).await {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![ReadyState::Uninitialized, ReadyState::Loading, ReadyState::Uninitialized]
        );
    }

    #[tokio::test]
    async fn test_two_clients_meet_in_room() {
        let relay_port = spawn_relay().await;
        let server = spawn_bootstrap(relay_port).await;

        let (_tx_a, rx_a) = mpsc::unbounded_channel();
        let connector_a = MockConnector::new();
        let alice = SkywayClient::spawn_with(connector_a.clone(), rx_a, config(&server));
        let mut alice_events = record(&alice, &[EventKind::JoinedRoom, EventKind::PeerJoined]);

        assert_eq!(alice.join_room().await.unwrap(), JoinStep::NeedBootstrap);
        let joined = wait_for(&mut alice_events, |e| matches!(e, Event::JoinedRoom(_))).await;
        assert_eq!(joined, Event::JoinedRoom(RoomId::from("lobby")));

        let (_tx_b, rx_b) = mpsc::unbounded_channel();
        let connector_b = MockConnector::new();
        let bob = SkywayClient::spawn_with(connector_b.clone(), rx_b, config(&server));
        let mut bob_events = record(&bob, &[EventKind::JoinedRoom, EventKind::PeerJoined]);
        bob.join_room().await.unwrap();

        let seen_by_alice = wait_for(&mut alice_events, |e| matches!(e, Event::PeerJoined(_))).await;
        let seen_by_bob = wait_for(&mut bob_events, |e| matches!(e, Event::PeerJoined(_))).await;

        let alice_snapshot = alice.snapshot().await.unwrap();
        let bob_snapshot = bob.snapshot().await.unwrap();
        let alice_id = alice_snapshot.local_id.clone().unwrap();
        let bob_id = bob_snapshot.local_id.clone().unwrap();

        assert_eq!(seen_by_alice, Event::PeerJoined(bob_id.clone()));
        assert_eq!(seen_by_bob, Event::PeerJoined(alice_id.clone()));
        assert_eq!(alice_snapshot.peers, vec![bob_id]);
        assert_eq!(bob_snapshot.peers, vec![alice_id.clone()]);

        // The welcomed side opens the connection and offers
        assert!(connector_a.opened().is_empty());
        assert_eq!(connector_b.opened().len(), 1);
        assert_eq!(connector_b.opened()[0].0, alice_id);

        assert!(bob.leave_room().await.unwrap());
        let snapshot = bob.snapshot().await.unwrap();
        assert_eq!(snapshot.ready_state, ReadyState::Uninitialized);
        assert_eq!(snapshot.room_state, RoomState::Outside);
        assert!(snapshot.peers.is_empty());
        assert!(!bob.leave_room().await.unwrap());
    }
}
