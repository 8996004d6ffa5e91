//! Session bootstrap: one HTTP GET that hands out credentials and the
//! signaling endpoint.

use std::time::Duration;

use skyway_shared::constants::BOOTSTRAP_CLIENT_QUERY;
use skyway_shared::error::BootstrapError;
use skyway_shared::session::Credentials;
use tracing::{info, warn};

pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(15);

/// `<server><api_key>/room/<room>?client=native`, where the room defaults to
/// the API key.
pub fn bootstrap_url(server: &str, api_key: &str, room: Option<&str>) -> String {
    let room = room.filter(|r| !r.is_empty()).unwrap_or(api_key);
    format!("{server}{api_key}/room/{room}?{BOOTSTRAP_CLIENT_QUERY}")
}

pub async fn fetch_session(url: &str) -> Result<Credentials, BootstrapError> {
    fetch_session_with(&reqwest::Client::new(), url).await
}

/// Fetch with a caller-provided HTTP client.
pub async fn fetch_session_with(
    client: &reqwest::Client,
    url: &str,
) -> Result<Credentials, BootstrapError> {
    info!(url, "Fetching session info");

    let response = client
        .get(url)
        .timeout(BOOTSTRAP_TIMEOUT)
        .send()
        .await
        .map_err(|e| BootstrapError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        warn!(url, status = status.as_u16(), "Bootstrap request rejected");
        return Err(BootstrapError::Status(status.as_u16()));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| BootstrapError::Transport(e.to_string()))?;
    let credentials = Credentials::from_json(&body)?;

    info!(
        user = %credentials.user.id.short(),
        room = %credentials.room.id,
        signaling = %credentials.signaling.ws_url(),
        "Session info received"
    );
    Ok(credentials)
}
