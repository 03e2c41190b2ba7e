//! Outbound domain events.

use log::{debug, warn};
use shared::Event;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// Destination for events produced by sessions. Delivery is fire-and-forget.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Buffers events until the backend pulls them with `GetEvent`.
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Next event, waiting up to `wait` for one to arrive.
    pub async fn next(&self, wait: Duration) -> Option<Event> {
        let mut rx = self.rx.lock().await;
        timeout(wait, rx.recv()).await.ok().flatten()
    }

    pub async fn try_next(&self) -> Option<Event> {
        self.rx.lock().await.try_recv().ok()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventQueue {
    fn publish(&self, event: Event) {
        debug!("#{}: event {}", event.match_id(), event.name());
        if let Err(e) = self.tx.send(event) {
            warn!("Dropping event {}: queue closed", e.0.name());
        }
    }
}
