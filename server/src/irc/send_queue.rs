use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use super::link::LinkFault;

/// Minimum interval between upstream messages.
pub const DEFAULT_PACING_WINDOW: Duration = Duration::from_millis(1500);
/// Lines held while a pacing window is active; enqueues past this are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Pacing state for outbound lines: one immediate send opens a window, and
/// while the window is active lines wait for the next window boundary.
pub struct PacedQueue {
    pending: VecDeque<String>,
    capacity: usize,
    window_active: bool,
    dropped: u64,
}

impl PacedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity,
            window_active: false,
            dropped: 0,
        }
    }

    /// Accept a line. Returns it back if it should be written right now,
    /// which also opens a new window.
    pub fn enqueue(&mut self, line: String) -> Option<String> {
        if !self.window_active {
            self.window_active = true;
            return Some(line);
        }

        if self.pending.len() < self.capacity {
            self.pending.push_back(line);
        } else {
            self.dropped += 1;
        }
        None
    }

    /// Window boundary reached. Returns the oldest pending line, or closes
    /// the window when nothing is waiting.
    pub fn tick(&mut self) -> Option<String> {
        let next = self.pending.pop_front();
        if next.is_none() {
            self.window_active = false;
        }
        next
    }

    pub fn is_window_active(&self) -> bool {
        self.window_active
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total lines dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Drain `lines` to `writer`, paced by `window`.
///
/// Runs until the line sender is dropped or a write fails. A write failure is
/// reported once on `faults` and nothing further is sent.
pub async fn run_sender<W>(
    mut writer: W,
    mut lines: mpsc::Receiver<String>,
    faults: mpsc::Sender<LinkFault>,
    window: Duration,
    capacity: usize,
) where
    W: AsyncWrite + Unpin,
{
    let mut queue = PacedQueue::new(capacity);
    let mut deadline = Instant::now();

    loop {
        let to_send = tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                let dropped_before = queue.dropped();
                let now = queue.enqueue(line);
                if queue.dropped() > dropped_before {
                    warn!(capacity, "upstream send queue full, dropping line");
                }
                now
            }
            _ = sleep_until(deadline), if queue.is_window_active() => queue.tick(),
        };

        if let Some(line) = to_send {
            if let Err(e) = write_line(&mut writer, &line).await {
                let _ = faults.send(LinkFault::Write(e)).await;
                return;
            }
            debug!(queued = queue.len(), "sent upstream line");
            deadline = Instant::now() + window;
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
