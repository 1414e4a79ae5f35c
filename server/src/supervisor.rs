use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::channel_set::ChannelSet;
use crate::engine::events::Command;
use crate::irc::link::{Credentials, LinkFault, LinkSettings, UpstreamLink};

/// Default wait between a link failure and the next attempt.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Owns everything that must survive a reconnect (channel membership, the
/// command stream, the event sink) and builds a fresh link for every attempt.
pub struct Supervisor {
    settings: LinkSettings,
    credentials: Credentials,
    channels: ChannelSet,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<String>,
    backoff: Duration,
}

impl Supervisor {
    pub fn new(
        settings: LinkSettings,
        credentials: Credentials,
        channels: ChannelSet,
        commands: mpsc::Receiver<Command>,
        events: mpsc::Sender<String>,
        backoff: Duration,
    ) -> Self {
        Self {
            settings,
            credentials,
            channels,
            commands,
            events,
            backoff,
        }
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// Run links back to back until cancelled or until no command producer is
    /// left. Returns the channel set as it stood at exit.
    pub async fn run(mut self, cancel: CancellationToken) -> ChannelSet {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            let fault = tokio::select! {
                _ = cancel.cancelled() => break,
                fault = self.run_once() => fault,
            };

            if matches!(fault, LinkFault::CommandsClosed) {
                info!("command stream closed, supervisor stopping");
                break;
            }

            warn!(attempt, error = %fault, backoff = ?self.backoff, "upstream link lost, reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        info!("supervisor stopped");
        self.channels
    }

    /// Build one link and drive it until it faults.
    async fn run_once(&mut self) -> LinkFault {
        let link = match UpstreamLink::connect(&self.settings, &self.credentials).await {
            Ok(link) => link,
            Err(fault) => return fault,
        };
        link.run(&mut self.channels, &mut self.commands, &self.events)
            .await
    }
}
