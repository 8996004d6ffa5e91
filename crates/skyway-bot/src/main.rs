//! # skyway-bot
//!
//! Headless room participant. It joins a room as soon as the session is
//! ready, echoes chat messages and can push a file to every peer once their
//! connection is established.

mod config;

use std::collections::HashSet;

use anyhow::Context;
use serde_json::{json, Value};
use skyway_client::{load_file, ClientConfig, SkywayClient};
use skyway_shared::constants::SELF_DISPLAY_NAME;
use skyway_shared::events::{Event, EventKind, Flow};
use skyway_shared::protocol::RedirectAction;
use skyway_shared::types::{PeerId, ReadyState};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::BotConfig;

/// Work requested by event handlers, carried out on the main task.
#[derive(Debug)]
enum BotAction {
    Join,
    Echo(Value),
    SendFile(PeerId),
    Stop(String),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,skyway_bot=debug,skyway_media=debug")),
        )
        .init();

    info!("Starting Skyway bot v{}", env!("CARGO_PKG_VERSION"));

    let config = BotConfig::from_env();
    info!(?config, "Loaded configuration");
    let api_key = config
        .api_key
        .clone()
        .context("SKYWAY_API_KEY must be set")?;

    let client = SkywayClient::spawn(ClientConfig {
        server: config.server.clone(),
        api_key: None,
        room: config.room.clone(),
        display_name: Some(config.display_name.clone()),
    })?;

    let (action_tx, mut action_rx) = mpsc::unbounded_channel::<BotAction>();
    register_handlers(&client, &config, action_tx);

    client
        .init(&config.server, &api_key, config.room.as_deref())
        .await?;

    let mut served: HashSet<PeerId> = HashSet::new();
    loop {
        tokio::select! {
            action = action_rx.recv() => {
                let Some(action) = action else { break };
                match action {
                    BotAction::Join => {
                        let step = client.join_room().await?;
                        info!(?step, "Join requested");
                    }
                    BotAction::Echo(message) => {
                        client.send_chat(json!({ "echo": message }), None).await?;
                    }
                    BotAction::SendFile(peer) => {
                        let Some(path) = &config.send_file else { continue };
                        // connected and completed both arrive per peer
                        if !served.insert(peer.clone()) {
                            continue;
                        }
                        match load_file(path).await {
                            Ok((file, data)) => match client.send_file(file, data, Some(peer.clone())).await {
                                Ok(item) => info!(peer = %peer.short(), item = %item, "File sent"),
                                Err(e) => warn!(error = %e, "File transfer failed"),
                            },
                            Err(e) => warn!(path = %path.display(), error = %e, "Cannot read file"),
                        }
                    }
                    BotAction::Stop(reason) => {
                        warn!(reason = %reason, "Stopping");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    client.shutdown().await?;
    Ok(())
}

fn register_handlers(client: &SkywayClient, config: &BotConfig, actions: mpsc::UnboundedSender<BotAction>) {
    let tx = actions.clone();
    client.on(EventKind::ReadyStateChange, move |event| {
        if let Event::ReadyStateChange(ReadyState::Ready) = event {
            let _ = tx.send(BotAction::Join);
        }
        Flow::Continue
    });

    client.on(EventKind::JoinedRoom, |event| {
        if let Event::JoinedRoom(room) = event {
            info!(room = %room, "Joined room");
        }
        Flow::Continue
    });

    client.on(EventKind::PeerJoined, |event| {
        if let Event::PeerJoined(peer) = event {
            info!(peer = %peer.short(), "Peer joined");
        }
        Flow::Continue
    });

    client.on(EventKind::PeerLeft, |event| {
        if let Event::PeerLeft(peer) = event {
            info!(peer = %peer.short(), "Peer left");
        }
        Flow::Continue
    });

    if config.echo_chat {
        let tx = actions.clone();
        let own_name = config.display_name.clone();
        client.on(EventKind::ChatMessage, move |event| {
            if let Event::ChatMessage {
                message,
                display_name,
                ..
            } = event
            {
                let own = display_name == &own_name || display_name == SELF_DISPLAY_NAME;
                if !own && message.get("echo").is_none() {
                    let _ = tx.send(BotAction::Echo(message.clone()));
                }
            }
            Flow::Continue
        });
    }

    if config.send_file.is_some() {
        let tx = actions.clone();
        client.on(EventKind::IceConnectionState, move |event| {
            if let Event::IceConnectionState { state, peer } = event {
                if state.is_established() {
                    let _ = tx.send(BotAction::SendFile(peer.clone()));
                }
            }
            Flow::Continue
        });
    }

    client.on(EventKind::ReceivedData, |event| {
        if let Event::ReceivedData { item, .. } = event {
            info!(
                name = %item.info.name,
                size = item.data.len(),
                sender = %item.sender.short(),
                "Received item"
            );
        }
        Flow::Continue
    });

    client.on(EventKind::NegotiationError, |event| {
        if let Event::NegotiationError { peer, reason } = event {
            warn!(peer = %peer.short(), error = %reason, "Negotiation failed");
        }
        Flow::Continue
    });

    let tx = actions;
    client.on(EventKind::Redirect, move |event| {
        if let Event::Redirect { action, url, info } = event {
            warn!(?action, url = ?url, info = ?info, "Relay redirect");
            if *action != RedirectAction::Warning {
                let _ = tx.send(BotAction::Stop(info.clone().unwrap_or_else(|| "redirected".into())));
            }
        }
        Flow::Continue
    });
}
