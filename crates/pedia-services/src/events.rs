//! Node-wide event bus.
//!
//! Link and distribution components publish here; the API and tests
//! subscribe. Slow subscribers lag and lose the oldest events rather than
//! stalling publishers.

use std::path::PathBuf;

use pedia_core::{FileId, PeerId};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    /// Reliable channel to the peer opened.
    PeerConnected { peer_id: PeerId },
    /// Link to the peer was torn down.
    PeerRemoved { peer_id: PeerId },
    /// Reconnection attempts exhausted.
    PeerGone { peer_id: PeerId },
    FileShared { file_id: FileId, peer_count: usize },
    DownloadProgress {
        file_id: FileId,
        fraction: f64,
        downloaded: usize,
        total: usize,
    },
    DownloadComplete {
        file_id: FileId,
        path: PathBuf,
        elapsed_ms: u64,
        /// Bytes per second over the whole transfer.
        throughput: f64,
    },
    DownloadError { file_id: FileId, error: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        tracing::trace!(?event, "event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(Event::PeerConnected {
            peer_id: PeerId::from("a"),
        });
        bus.emit(Event::PeerRemoved {
            peer_id: PeerId::from("a"),
        });
        assert!(matches!(rx.recv().await.unwrap(), Event::PeerConnected { .. }));
        assert!(matches!(rx.recv().await.unwrap(), Event::PeerRemoved { .. }));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        EventBus::new(4).emit(Event::PeerGone {
            peer_id: PeerId::from("x"),
        });
    }

    #[test]
    fn events_serialize_kebab_case() {
        let json = serde_json::to_value(Event::DownloadError {
            file_id: FileId::from("f"),
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "download-error");
        assert_eq!(json["file_id"], "f");
    }
}
