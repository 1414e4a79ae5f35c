use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::endpoint::{DEFAULT_ENDPOINT_QUEUE, Delivery, Endpoint};
use super::events::{Command, EndpointId};

/// Queued events waiting for fan-out.
const EVENT_QUEUE: usize = 64;
/// Queued commands waiting for the upstream link.
const COMMAND_QUEUE: usize = 32;
/// Queued endpoint removals.
const REMOVAL_QUEUE: usize = 32;

/// Pause after a failed accept so a persistent error (fd exhaustion) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Default consecutive drops after which a slow endpoint is disconnected.
pub const DEFAULT_MAX_LAGGED_EVENTS: usize = 1024;

#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    pub endpoint_queue_capacity: usize,
    pub max_lagged_events: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            endpoint_queue_capacity: DEFAULT_ENDPOINT_QUEUE,
            max_lagged_events: DEFAULT_MAX_LAGGED_EVENTS,
        }
    }
}

/// The live endpoint collection. Owned by the coordinator task only.
pub struct Registry {
    endpoints: Vec<Endpoint>,
    next_id: EndpointId,
    max_lagged: usize,
}

impl Registry {
    pub fn new(max_lagged: usize) -> Self {
        Self {
            endpoints: Vec::with_capacity(16),
            next_id: 1,
            max_lagged,
        }
    }

    /// Next identifier. Identifiers are never reused.
    pub fn allocate_id(&mut self) -> EndpointId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, endpoint: Endpoint) {
        self.endpoints.push(endpoint);
    }

    /// Stop and forget an endpoint. Returns false if it was already gone.
    pub fn remove(&mut self, id: EndpointId) -> bool {
        let Some(idx) = self.endpoints.iter().position(|ep| ep.id == id) else {
            return false;
        };
        let endpoint = self.endpoints.swap_remove(idx);
        endpoint.stop();
        true
    }

    /// Deliver one event to every endpoint. Endpoints whose output duty is
    /// gone, or that have lagged past the limit, are removed. Returns the
    /// number of endpoints that queued the event.
    pub fn fan_out(&mut self, event: &Arc<str>) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for endpoint in &mut self.endpoints {
            match endpoint.deliver(event) {
                Delivery::Queued => delivered += 1,
                Delivery::Lagged(count) if count >= self.max_lagged => {
                    warn!(endpoint = endpoint.id, count, "endpoint too slow, disconnecting");
                    dead.push(endpoint.id);
                }
                Delivery::Lagged(count) => {
                    if count == 1 {
                        warn!(endpoint = endpoint.id, "endpoint queue full, dropping events");
                    }
                }
                Delivery::Closed => dead.push(endpoint.id),
            }
        }

        for id in dead {
            self.remove(id);
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn contains(&self, id: EndpointId) -> bool {
        self.endpoints.iter().any(|ep| ep.id == id)
    }

    /// Stop every endpoint.
    pub fn clear(&mut self) {
        for endpoint in self.endpoints.drain(..) {
            endpoint.stop();
        }
    }
}

/// Accepts downstream clients and fans upstream events out to all of them.
pub struct BroadcastServer {
    listener: TcpListener,
    settings: BroadcastSettings,
}

/// Producer side of a running broadcast server.
pub struct BroadcastHandle {
    events: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

impl BroadcastHandle {
    /// Sender for JSON event lines; each line goes to every endpoint.
    pub fn events(&self) -> mpsc::Sender<String> {
        self.events.clone()
    }

    /// Wait for the coordinator to exit.
    pub async fn join(self) {
        drop(self.events);
        let _ = self.task.await;
    }
}

impl BroadcastServer {
    /// Bind the listening address. Failure here is fatal to startup.
    pub async fn bind(addr: &str, settings: BroadcastSettings) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind broadcast listener on {}", addr))?;
        info!("broadcast listener started on {}", listener.local_addr()?);
        Ok(Self { listener, settings })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the coordinator. Returns the event handle and the single command
    /// stream fed by every endpoint.
    pub fn start(self, cancel: CancellationToken) -> (BroadcastHandle, mpsc::Receiver<Command>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);

        let task = tokio::spawn(coordinate(
            self.listener,
            self.settings,
            events_rx,
            commands_tx,
            cancel,
        ));

        (
            BroadcastHandle {
                events: events_tx,
                task,
            },
            commands_rx,
        )
    }
}

/// Coordinator loop. Handles exactly one of {event, connection, removal} at a
/// time, so the registry never needs a lock.
async fn coordinate(
    listener: TcpListener,
    settings: BroadcastSettings,
    mut events: mpsc::Receiver<String>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
) {
    let mut registry = Registry::new(settings.max_lagged_events);
    let (removals_tx, mut removals) = mpsc::channel::<EndpointId>(REMOVAL_QUEUE);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("broadcast server shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    info!("event stream closed, broadcast server stopping");
                    break;
                };
                registry.fan_out(&Arc::from(event));
            }
            Some(id) = removals.recv() => {
                if registry.remove(id) {
                    info!(endpoint = id, remaining = registry.len(), "endpoint disconnected");
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let id = registry.allocate_id();
                        let endpoint = Endpoint::spawn(
                            id,
                            stream,
                            settings.endpoint_queue_capacity,
                            removals_tx.clone(),
                            commands.clone(),
                        );
                        registry.insert(endpoint);
                        info!(endpoint = id, %peer, total = registry.len(), "endpoint connected");
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept downstream connection");
                        if !pause_after_accept_error(&cancel).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    registry.clear();
}

/// Wait out `ACCEPT_ERROR_BACKOFF`. Returns false if cancelled meanwhile.
async fn pause_after_accept_error(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}
