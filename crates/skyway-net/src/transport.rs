use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::info;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for the WebSocket handshake with the relay
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Open the WebSocket to the signaling relay.
pub async fn connect(url: &str) -> anyhow::Result<WsStream> {
    let (stream, response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .with_context(|| format!("Timed out connecting to {url}"))?
        .with_context(|| format!("WebSocket handshake with {url} failed"))?;

    info!(url, status = %response.status(), "Connected to signaling relay");
    Ok(stream)
}
