//! Signaling channel task with the tokio mpsc command/notification pattern.
//!
//! The WebSocket lives in its own task. The client talks to it through a
//! command sender and reads back notifications, one per text frame.
//! Commands are unbounded so a sender never waits on a task that is itself
//! blocked delivering notifications.

use futures::{SinkExt, StreamExt};
use skyway_shared::constants::CHANNEL_CAPACITY;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::transport::connect;

/// Commands sent *into* the channel task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Send one payload as a text frame.
    Send(String),
    /// Close the socket and stop the task.
    Close,
}

/// Notifications sent *from* the channel task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotification {
    Opened,
    /// One inbound payload.
    Message(Vec<u8>),
    Error(String),
    /// Always the last notification.
    Closed,
}

/// Spawn the signaling channel for `url` in a background task.
///
/// Connecting happens inside the task; failure is reported as `Error`
/// followed by `Closed`.
pub fn spawn_signaling(
    url: String,
) -> (
    mpsc::UnboundedSender<ChannelCommand>,
    mpsc::Receiver<ChannelNotification>,
) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ChannelCommand>();
    let (notif_tx, notif_rx) = mpsc::channel::<ChannelNotification>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let stream = match connect(&url).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(url = %url, error = %e, "Signaling connection failed");
                let _ = notif_tx.send(ChannelNotification::Error(format!("{e:#}"))).await;
                let _ = notif_tx.send(ChannelNotification::Closed).await;
                return;
            }
        };
        let (mut write, mut read) = stream.split();
        let _ = notif_tx.send(ChannelNotification::Opened).await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ChannelCommand::Send(text)) => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                error!(error = %e, "Failed to send signaling frame");
                                let _ = notif_tx.send(ChannelNotification::Error(e.to_string())).await;
                                break;
                            }
                        }
                        Some(ChannelCommand::Close) => {
                            info!("Signaling channel close requested");
                            if let Err(e) = write.close().await {
                                debug!(error = %e, "Error while closing signaling socket");
                            }
                            break;
                        }
                        None => {
                            // All senders dropped
                            info!("Command channel closed, shutting down signaling");
                            let _ = write.close().await;
                            break;
                        }
                    }
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            debug!(len = text.len(), "Signaling frame received");
                            let _ = notif_tx
                                .send(ChannelNotification::Message(text.into_bytes()))
                                .await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            let _ = notif_tx.send(ChannelNotification::Message(data)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(frame = ?frame, "Signaling relay closed the socket");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Signaling socket error");
                            let _ = notif_tx.send(ChannelNotification::Error(e.to_string())).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = notif_tx.send(ChannelNotification::Closed).await;
        info!("Signaling task terminated");
    });

    (cmd_tx, notif_rx)
}
