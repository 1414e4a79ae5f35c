use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::channel_set::{ChannelSet, normalize_channel_name};
use crate::engine::events::{Command, encode_event};

use super::chat::ChatSynthesizer;
use super::framer::{LineFramer, LineReader};
use super::parser::IrcMessage;
use super::send_queue::run_sender;

/// Queued inbound lines between the socket reader and the dispatcher.
const INBOUND_QUEUE: usize = 64;
/// Queued outbound lines between the dispatcher and the pacer.
const OUTBOUND_QUEUE: usize = 256;

/// Capabilities requested alongside every JOIN.
const CAPABILITIES: [&str; 2] = ["twitch.tv/tags", "twitch.tv/commands"];

/// Why an upstream link stopped. Every variant is terminal for that link.
#[derive(Debug)]
pub enum LinkFault {
    Dial(std::io::Error),
    Handshake(std::io::Error),
    Read(std::io::Error),
    Write(std::io::Error),
    /// The service asked us to go away (`RECONNECT`, `ERROR`).
    Disconnected(String),
    /// Every command producer is gone; nothing can drive the link.
    CommandsClosed,
}

impl std::fmt::Display for LinkFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkFault::Dial(e) => write!(f, "dial failed: {}", e),
            LinkFault::Handshake(e) => write!(f, "handshake failed: {}", e),
            LinkFault::Read(e) => write!(f, "read failed: {}", e),
            LinkFault::Write(e) => write!(f, "write failed: {}", e),
            LinkFault::Disconnected(reason) => write!(f, "disconnected by upstream: {}", reason),
            LinkFault::CommandsClosed => write!(f, "command stream closed"),
        }
    }
}

impl std::error::Error for LinkFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkFault::Dial(e) | LinkFault::Handshake(e) | LinkFault::Read(e) | LinkFault::Write(e) => {
                Some(e)
            }
            _ => None,
        }
    }
}

/// Connection lifecycle. A constructed link is `Active`; `run` consumes it on
/// the way to `Faulted`, so the owner builds a new link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Active,
    Faulted,
}

/// Account name and token presented in the handshake.
#[derive(Clone)]
pub struct Credentials {
    pub account: String,
    /// Full `PASS` argument, including the `oauth:` prefix.
    pub token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub address: String,
    pub service_host: String,
    pub pacing_window: Duration,
    pub send_queue_capacity: usize,
}

/// First-byte routing for inbound lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    /// `PING :<token>`
    Ping,
    /// `ERROR :<reason>` closing link
    Error,
    /// `:<prefix> ...` without tags
    Server,
    /// `@tags :<prefix> ...`
    Tagged,
}

impl LineKind {
    fn classify(line: &str) -> Option<Self> {
        match line.as_bytes().first()? {
            b'P' => Some(LineKind::Ping),
            b'E' => Some(LineKind::Error),
            b':' => Some(LineKind::Server),
            b'@' => Some(LineKind::Tagged),
            _ => None,
        }
    }
}

/// One upstream connection: handshake, inbound dispatch, command execution.
///
/// Owns a reader task (socket -> lines) and a sender task (lines -> paced
/// socket writes). The dispatcher runs in whatever task calls [`UpstreamLink::run`].
pub struct UpstreamLink {
    state: LinkState,
    synth: ChatSynthesizer,
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Receiver<String>,
    faults: mpsc::Receiver<LinkFault>,
    reader: JoinHandle<()>,
    sender: JoinHandle<()>,
}

impl UpstreamLink {
    /// Dial the service and perform the handshake.
    pub async fn connect(
        settings: &LinkSettings,
        credentials: &Credentials,
    ) -> Result<Self, LinkFault> {
        debug!(address = %settings.address, "dialing upstream");
        let stream = TcpStream::connect(&settings.address)
            .await
            .map_err(LinkFault::Dial)?;
        Self::establish(stream, settings, credentials).await
    }

    /// Perform the handshake over an already-open stream and start the
    /// reader and sender tasks.
    pub async fn establish<S>(
        stream: S,
        settings: &LinkSettings,
        credentials: &Credentials,
    ) -> Result<Self, LinkFault>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        debug!(state = ?LinkState::Connecting, account = %credentials.account, "sending handshake");
        let (read_half, mut write_half) = tokio::io::split(stream);

        let handshake = format!(
            "{}{}",
            IrcMessage::new("PASS", vec![credentials.token.clone()]).to_line(),
            IrcMessage::new("NICK", vec![credentials.account.clone()]).to_line(),
        );
        write_half
            .write_all(handshake.as_bytes())
            .await
            .map_err(LinkFault::Handshake)?;
        write_half.flush().await.map_err(LinkFault::Handshake)?;

        let (fault_tx, faults) = mpsc::channel(8);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let reader = tokio::spawn(read_lines(read_half, inbound_tx, fault_tx.clone()));
        let sender = tokio::spawn(run_sender(
            write_half,
            outbound_rx,
            fault_tx,
            settings.pacing_window,
            settings.send_queue_capacity,
        ));

        info!(account = %credentials.account, "upstream link established");

        Ok(Self {
            state: LinkState::Active,
            synth: ChatSynthesizer::new(&settings.service_host),
            outbound,
            inbound,
            faults,
            reader,
            sender,
        })
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Replay joins, then dispatch inbound lines and commands until the link faults.
    pub async fn run(
        mut self,
        channels: &mut ChannelSet,
        commands: &mut mpsc::Receiver<Command>,
        events: &mpsc::Sender<String>,
    ) -> LinkFault {
        self.join_all(channels).await;

        let fault = loop {
            tokio::select! {
                line = self.inbound.recv() => {
                    let Some(line) = line else {
                        // reader reports its fault before dropping the line queue
                        break self.faults.try_recv().unwrap_or_else(|_| {
                            LinkFault::Read(std::io::ErrorKind::UnexpectedEof.into())
                        });
                    };
                    if let Err(fault) = self.handle_line(&line, events).await {
                        break fault;
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else { break LinkFault::CommandsClosed };
                    self.handle_command(command, channels).await;
                }
                fault = self.faults.recv() => {
                    break fault.unwrap_or_else(|| {
                        LinkFault::Read(std::io::ErrorKind::UnexpectedEof.into())
                    });
                }
            }
        };

        warn!(state = ?LinkState::Faulted, error = %fault, "upstream link faulted");
        fault
    }

    /// Send JOIN for every channel in the set, regardless of prior state.
    pub async fn join_all(&self, channels: &ChannelSet) {
        let mut lines = Vec::with_capacity(channels.len());
        channels.for_each(|name| lines.push(join_line(name)));
        info!(count = lines.len(), "rejoining channels");
        for line in lines {
            self.enqueue(line).await;
        }
    }

    async fn handle_line(&self, line: &str, events: &mpsc::Sender<String>) -> Result<(), LinkFault> {
        let Some(kind) = LineKind::classify(line) else {
            return Ok(());
        };

        match kind {
            LineKind::Ping => self.handle_ping(line).await,
            LineKind::Error => return Err(LinkFault::Disconnected(line.to_string())),
            LineKind::Server => self.handle_server_line(line)?,
            LineKind::Tagged => self.handle_chat(line, events).await,
        }
        Ok(())
    }

    async fn handle_ping(&self, line: &str) {
        let Ok(msg) = IrcMessage::parse(line) else { return };
        if msg.command != "PING" {
            return;
        }
        let token = msg
            .params
            .first()
            .cloned()
            .unwrap_or_else(|| self.synth.service_host().to_string());
        self.enqueue(format!("PONG :{}\r\n", token.replace(['\r', '\n'], "")))
            .await;
    }

    fn handle_server_line(&self, line: &str) -> Result<(), LinkFault> {
        let Ok(msg) = IrcMessage::parse(line) else { return Ok(()) };
        if msg.command == "RECONNECT" && msg.prefix_host().is_some_and(|h| self.synth.is_service_host(h)) {
            return Err(LinkFault::Disconnected("RECONNECT".into()));
        }
        Ok(())
    }

    async fn handle_chat(&self, line: &str, events: &mpsc::Sender<String>) {
        let Some(metadata) = self.synth.synthesize(line) else {
            debug!("tagged line without channel dropped");
            return;
        };
        match encode_event(&metadata) {
            Ok(json) => {
                // the broadcast coordinator outlives every link
                let _ = events.send(json).await;
            }
            Err(e) => warn!(error = %e, "failed to encode chat event"),
        }
    }

    async fn handle_command(&self, command: Command, channels: &mut ChannelSet) {
        let Some(channel) = normalize_channel_name(command.channel()) else {
            debug!(channel = %command.channel(), "ignoring command for invalid channel name");
            return;
        };

        match command {
            Command::Join { .. } => {
                if channels.add(channel.clone()) {
                    debug!(%channel, "joining");
                    self.enqueue(join_line(&channel)).await;
                }
            }
            Command::Leave { .. } => {
                if channels.remove(&channel) {
                    debug!(%channel, "leaving");
                    self.enqueue(IrcMessage::new("PART", vec![format!("#{}", channel)]).to_line())
                        .await;
                }
            }
            Command::Chat { message, .. } => {
                if message.trim().is_empty() || !channels.contains(&channel) {
                    return;
                }
                debug!(%channel, "sending chat message");
                self.enqueue(privmsg_line(&channel, &message)).await;
            }
        }
    }

    async fn enqueue(&self, line: String) {
        // A closed queue means the sender hit a write error; its fault is
        // already on the way.
        let _ = self.outbound.send(line).await;
    }
}

impl Drop for UpstreamLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.sender.abort();
    }
}

/// JOIN plus capability requests, sent as one paced unit.
fn join_line(channel: &str) -> String {
    let mut line = IrcMessage::new("JOIN", vec![format!("#{}", channel)]).to_line();
    for cap in CAPABILITIES {
        line.push_str(&format!("CAP REQ :{}\r\n", cap));
    }
    line
}

/// `PRIVMSG #<channel> :<text>`, always with the trailing colon. CR/LF in the
/// text become spaces.
fn privmsg_line(channel: &str, text: &str) -> String {
    format!("PRIVMSG #{} :{}\r\n", channel, text.replace(['\r', '\n'], " "))
}

async fn read_lines<R>(
    reader: R,
    lines: mpsc::Sender<String>,
    faults: mpsc::Sender<LinkFault>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = LineReader::new(reader, LineFramer::crlf());
    loop {
        match reader.next_line().await {
            Ok(line) => {
                if lines.send(line).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = faults.send(LinkFault::Read(e)).await;
                return;
            }
        }
    }
}
