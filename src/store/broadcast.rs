//! Row-change fan-out.
//!
//! Every observer-facing write is mirrored onto one broadcast channel.
//! Subscribers (the websocket feed, tests) filter by session id and topic
//! on their side; a send with no receivers is fine.

use tokio::sync::broadcast;

use crate::models::LiveEvent;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<LiveEvent>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: LiveEvent) {
        // Lagging or absent receivers are not an error for the publisher.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
