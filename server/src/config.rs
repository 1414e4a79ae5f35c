use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, warn};

use crate::engine::broadcast::BroadcastSettings;
use crate::engine::channel_set::{ChannelSet, normalize_channel_name};
use crate::irc::link::{Credentials, LinkSettings};

/// Top-level bridge configuration, loaded from bridge.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub upstream: UpstreamSection,
    pub server: ServerSection,
    /// Channels joined on startup, in addition to any given on the command line.
    pub channels: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub address: String,
    /// Host the service uses in message prefixes.
    pub service_host: String,
    pub pacing_window_ms: u64,
    pub send_queue_capacity: usize,
    pub reconnect_backoff_secs: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            address: "irc.chat.twitch.tv:6667".into(),
            service_host: "tmi.twitch.tv".into(),
            pacing_window_ms: 1500,
            send_queue_capacity: 4096,
            reconnect_backoff_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen_address: String,
    pub endpoint_queue_capacity: usize,
    /// Consecutive dropped events before a slow client is disconnected.
    pub max_lagged_events: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:44632".into(),
            endpoint_queue_capacity: 256,
            max_lagged_events: 1024,
        }
    }
}

impl BridgeConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path))?;
            Self::parse(&contents).with_context(|| format!("failed to parse config file {}", path))?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        if let Some(v) = var("UPSTREAM_ADDRESS") {
            self.upstream.address = v;
        }
        if let Some(v) = var("UPSTREAM_SERVICE_HOST") {
            self.upstream.service_host = v;
        }
        if let Some(v) = var("PACING_WINDOW_MS")
            && let Ok(ms) = v.parse()
        {
            self.upstream.pacing_window_ms = ms;
        }
        if let Some(v) = var("SEND_QUEUE_CAPACITY")
            && let Ok(n) = v.parse()
        {
            self.upstream.send_queue_capacity = n;
        }
        if let Some(v) = var("RECONNECT_BACKOFF_SECS")
            && let Ok(secs) = v.parse()
        {
            self.upstream.reconnect_backoff_secs = secs;
        }
        if let Some(v) = var("LISTEN_ADDRESS") {
            self.server.listen_address = v;
        }
        if let Some(v) = var("ENDPOINT_QUEUE_CAPACITY")
            && let Ok(n) = v.parse()
        {
            self.server.endpoint_queue_capacity = n;
        }
        if let Some(v) = var("MAX_LAGGED_EVENTS")
            && let Ok(n) = v.parse()
        {
            self.server.max_lagged_events = n;
        }
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            address: self.upstream.address.clone(),
            service_host: self.upstream.service_host.clone(),
            pacing_window: Duration::from_millis(self.upstream.pacing_window_ms),
            send_queue_capacity: self.upstream.send_queue_capacity,
        }
    }

    pub fn broadcast_settings(&self) -> BroadcastSettings {
        BroadcastSettings {
            endpoint_queue_capacity: self.server.endpoint_queue_capacity.max(1),
            max_lagged_events: self.server.max_lagged_events.max(1),
        }
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.upstream.reconnect_backoff_secs)
    }

    /// Initial channel set from config plus extra names. Invalid names are
    /// skipped with a warning.
    pub fn initial_channels(&self, extra: &[String]) -> ChannelSet {
        let mut set = ChannelSet::new();
        for raw in self.channels.iter().chain(extra) {
            match normalize_channel_name(raw) {
                Some(name) => {
                    set.add(name);
                }
                None => warn!(channel = %raw, "skipping invalid channel name"),
            }
        }
        set
    }
}

/// Read the token file and build handshake credentials.
pub fn load_credentials(account: &str, token_path: &Path) -> anyhow::Result<Credentials> {
    let raw = std::fs::read_to_string(token_path)
        .with_context(|| format!("could not open OAuth file at \"{}\"", token_path.display()))?;
    credentials_from_token(account, &raw)
}

pub fn credentials_from_token(account: &str, raw: &str) -> anyhow::Result<Credentials> {
    let token = raw.trim();
    if token.is_empty() {
        anyhow::bail!("OAuth token is empty");
    }
    if token.chars().any(char::is_whitespace) {
        anyhow::bail!("OAuth token must be a single word");
    }

    let token = if token.starts_with("oauth:") {
        token.to_string()
    } else {
        format!("oauth:{}", token)
    };

    Ok(Credentials {
        account: account.trim().to_ascii_lowercase(),
        token,
    })
}
