use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::irc::framer::{LineFramer, LineReader};

use super::events::{Command, EndpointId};

/// Default queued outbound events per endpoint.
pub const DEFAULT_ENDPOINT_QUEUE: usize = 256;

/// Outcome of handing one event to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; the event was dropped. Carries the consecutive drop count.
    Lagged(usize),
    /// The output duty is gone.
    Closed,
}

/// One downstream client connection.
///
/// The socket itself is owned by the endpoint's input and output tasks; the
/// registry keeps the queue sender and the stop signal.
#[derive(Debug)]
pub struct Endpoint {
    pub id: EndpointId,
    pub peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Arc<str>>,
    stop: CancellationToken,
    lagged: usize,
}

impl Endpoint {
    pub fn new(
        id: EndpointId,
        peer: Option<SocketAddr>,
        outbound: mpsc::Sender<Arc<str>>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            outbound,
            stop,
            lagged: 0,
        }
    }

    /// Start the input and output duties for an accepted connection.
    pub fn spawn(
        id: EndpointId,
        stream: TcpStream,
        queue_capacity: usize,
        removals: mpsc::Sender<EndpointId>,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        Self::spawn_halves(id, peer, read_half, write_half, queue_capacity, removals, commands)
    }

    pub fn spawn_halves<R, W>(
        id: EndpointId,
        peer: Option<SocketAddr>,
        reader: R,
        writer: W,
        queue_capacity: usize,
        removals: mpsc::Sender<EndpointId>,
        commands: mpsc::Sender<Command>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, queue) = mpsc::channel(queue_capacity);
        let stop = CancellationToken::new();

        tokio::spawn(write_events(id, writer, queue, stop.clone(), removals.clone()));
        tokio::spawn(read_commands(id, reader, stop.clone(), removals, commands));

        Self::new(id, peer, outbound, stop)
    }

    /// Queue an event without waiting. A full queue drops the event for this
    /// endpoint only.
    pub fn deliver(&mut self, event: &Arc<str>) -> Delivery {
        match self.outbound.try_send(event.clone()) {
            Ok(()) => {
                self.lagged = 0;
                Delivery::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.lagged += 1;
                Delivery::Lagged(self.lagged)
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Signal both duties to stop; they close the socket as they exit.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// Output duty: drain the queue to the socket until stopped or a write fails.
async fn write_events<W>(
    id: EndpointId,
    mut writer: W,
    mut queue: mpsc::Receiver<Arc<str>>,
    stop: CancellationToken,
    removals: mpsc::Sender<EndpointId>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = queue.recv() => {
                let Some(event) = event else { break };
                // a client that stopped reading blocks here, so stop must still win
                tokio::select! {
                    _ = stop.cancelled() => break,
                    result = writer.write_all(event.as_bytes()) => {
                        if let Err(e) = result {
                            debug!(endpoint = id, error = %e, "endpoint write failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    // Removal of an already-removed id is a no-op in the registry.
    let _ = removals.send(id).await;
}

/// Input duty: frame the socket into lines and forward decoded commands.
async fn read_commands<R>(
    id: EndpointId,
    reader: R,
    stop: CancellationToken,
    removals: mpsc::Sender<EndpointId>,
    commands: mpsc::Sender<Command>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = LineReader::new(reader, LineFramer::lf());

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            line = lines.next_line() => {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        debug!(endpoint = id, error = %e, "endpoint read ended");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::from_line(&line) {
                    Ok(command) => {
                        if commands.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(endpoint = id, error = %e, "dropping malformed command line"),
                }
            }
        }
    }

    let _ = removals.send(id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn endpoint_with_queue(capacity: usize) -> (Endpoint, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Endpoint::new(1, None, tx, CancellationToken::new()), rx)
    }

    #[test]
    fn test_deliver_queues_event() {
        let (mut ep, mut rx) = endpoint_with_queue(2);
        let event: Arc<str> = Arc::from("{}\n");
        assert_eq!(ep.deliver(&event), Delivery::Queued);
        assert_eq!(&*rx.try_recv().unwrap(), "{}\n");
    }

    #[test]
    fn test_deliver_full_queue_counts_consecutive_drops() {
        let (mut ep, mut rx) = endpoint_with_queue(1);
        let event: Arc<str> = Arc::from("x\n");
        assert_eq!(ep.deliver(&event), Delivery::Queued);
        assert_eq!(ep.deliver(&event), Delivery::Lagged(1));
        assert_eq!(ep.deliver(&event), Delivery::Lagged(2));

        rx.try_recv().unwrap();
        assert_eq!(ep.deliver(&event), Delivery::Queued);
        assert_eq!(ep.deliver(&event), Delivery::Lagged(1));
    }

    #[test]
    fn test_deliver_closed_queue() {
        let (mut ep, rx) = endpoint_with_queue(1);
        drop(rx);
        assert_eq!(ep.deliver(&Arc::from("x\n")), Delivery::Closed);
    }

    #[tokio::test]
    async fn test_duties_forward_commands_and_events() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (removals_tx, mut removals_rx) = mpsc::channel(4);
        let (commands_tx, mut commands_rx) = mpsc::channel(4);

        let mut ep =
            Endpoint::spawn_halves(7, None, server_read, server_write, 8, removals_tx, commands_tx);

        client_write
            .write_all(b"garbage\n{\"op\":\"join\",\"channel\":\"bar\"}\n")
            .await
            .unwrap();
        assert_eq!(
            commands_rx.recv().await.unwrap(),
            Command::Join { channel: "bar".into() }
        );

        assert_eq!(ep.deliver(&Arc::from("{\"a\":\"1\"}\n")), Delivery::Queued);
        let mut buf = [0u8; 64];
        let n = client_read.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"a\":\"1\"}\n");

        // client hangs up: input duty reports removal
        drop(client_write);
        drop(client_read);
        assert_eq!(removals_rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_stop_ends_both_duties() {
        let (_client, server) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (removals_tx, mut removals_rx) = mpsc::channel(4);
        let (commands_tx, _commands_rx) = mpsc::channel(4);

        let ep = Endpoint::spawn_halves(3, None, server_read, server_write, 8, removals_tx, commands_tx);
        ep.stop();
        assert!(ep.is_stopped());

        // the output duty reports its exit; the input duty returns silently
        assert_eq!(removals_rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_stop_interrupts_write_to_stalled_client() {
        // the client end is never read, so a large event fills the pipe
        let (client, server) = tokio::io::duplex(16);
        let (server_read, server_write) = tokio::io::split(server);
        let (removals_tx, mut removals_rx) = mpsc::channel(4);
        let (commands_tx, _commands_rx) = mpsc::channel(4);

        let mut ep =
            Endpoint::spawn_halves(5, None, server_read, server_write, 8, removals_tx, commands_tx);
        let event: Arc<str> = Arc::from("x".repeat(1024) + "\n");
        assert_eq!(ep.deliver(&event), Delivery::Queued);
        tokio::time::sleep(Duration::from_millis(20)).await;

        ep.stop();
        let removed = tokio::time::timeout(Duration::from_secs(2), removals_rx.recv()).await;
        assert_eq!(removed.expect("output duty ignored stop"), Some(5));
        drop(client);
    }
}
