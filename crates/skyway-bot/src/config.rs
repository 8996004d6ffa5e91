//! Bot configuration loaded from environment variables.
//!
//! Everything except the API key has a default, so a local run only needs
//! `SKYWAY_API_KEY`.

use std::path::PathBuf;

use skyway_client::DEFAULT_SERVER;

/// Bot configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotConfig {
    /// Bootstrap server prefix, ending with `/`.
    /// Env: `SKYWAY_SERVER`
    /// Default: [`DEFAULT_SERVER`]
    pub server: String,

    /// Env: `SKYWAY_API_KEY`
    pub api_key: Option<String>,

    /// Room to join. The API key's own room when unset.
    /// Env: `SKYWAY_ROOM`
    pub room: Option<String>,

    /// Env: `SKYWAY_DISPLAY_NAME`
    /// Default: `"Skyway bot"`
    pub display_name: String,

    /// Reply to every chat message with an echo.
    /// Env: `SKYWAY_ECHO_CHAT` (true/false)
    /// Default: `true`
    pub echo_chat: bool,

    /// File sent to peers once their connection is up.
    /// Env: `SKYWAY_SEND_FILE`
    pub send_file: Option<PathBuf>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            api_key: None,
            room: None,
            display_name: "Skyway bot".to_string(),
            echo_chat: true,
            send_file: None,
        }
    }
}

impl BotConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(server) = non_empty("SKYWAY_SERVER") {
            config.server = if server.ends_with('/') {
                server
            } else {
                tracing::warn!(value = %server, "SKYWAY_SERVER has no trailing slash, adding one");
                format!("{server}/")
            };
        }

        config.api_key = non_empty("SKYWAY_API_KEY");
        config.room = non_empty("SKYWAY_ROOM");

        if let Some(name) = non_empty("SKYWAY_DISPLAY_NAME") {
            config.display_name = name;
        }

        if let Some(val) = non_empty("SKYWAY_ECHO_CHAT") {
            match parse_bool(&val) {
                Some(flag) => config.echo_chat = flag,
                None => tracing::warn!(value = %val, "Invalid SKYWAY_ECHO_CHAT, using default"),
            }
        }

        config.send_file = non_empty("SKYWAY_SEND_FILE").map(PathBuf::from);

        config
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
