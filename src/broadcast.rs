//! Fan-out of successful mutating commands to real-time subscribers.
//!
//! One global topic for now: every subscriber sees every event. The hub is a
//! thin wrapper over a broadcast channel so per-group topics can be added
//! later without reworking the fan-out. Events are fire-and-forget; there is
//! no replay, so a subscriber that connects after an event was emitted never
//! sees it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{Conversation, GroupMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum BroadcastEvent {
    /// Greeting sent to each subscriber when its channel opens.
    Connection,
    NewGroup {
        group_id: String,
        conversation: Conversation,
    },
    NewMessage {
        group_id: String,
        group_name: String,
        sender: String,
        content: String,
    },
    #[serde(rename = "newMessageStream")]
    MessageStream { message: GroupMessage },
}

#[derive(Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<BroadcastEvent>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        BroadcastHub {
            tx,
            next_subscriber_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> BroadcastSubscriber {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        info!("New subscriber connected: {id}");
        BroadcastSubscriber {
            id,
            rx: self.tx.subscribe(),
        }
    }

    /// Fire-and-forget: emitting with zero subscribers is not an error.
    pub fn emit(&self, event: BroadcastEvent) {
        debug!("Broadcasting event to {} subscriber(s)", self.subscriber_count());
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct BroadcastSubscriber {
    id: u64,
    rx: broadcast::Receiver<BroadcastEvent>,
}

impl BroadcastSubscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the hub is gone. A lagging subscriber skips
    /// the events it missed rather than disconnecting.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Subscriber {} lagged, skipped {missed} event(s)", self.id);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for BroadcastSubscriber {
    fn drop(&mut self) {
        info!("Subscriber disconnected: {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_every_event() {
        let hub = BroadcastHub::new(8);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.emit(BroadcastEvent::NewMessage {
            group_id: "g1".to_string(),
            group_name: "Team".to_string(),
            sender: "0xa".to_string(),
            content: "hi".to_string(),
        });

        let a = first.recv().await.expect("first event");
        let b = second.recv().await.expect("second event");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn late_subscriber_sees_nothing() {
        let hub = BroadcastHub::new(8);
        hub.emit(BroadcastEvent::Connection);

        let mut late = hub.subscribe();
        hub.emit(BroadcastEvent::Connection);
        // Only the event emitted after subscribing arrives.
        assert!(late.recv().await.is_some());
        let empty = tokio::time::timeout(std::time::Duration::from_millis(50), late.recv()).await;
        assert!(empty.is_err());
    }

    #[test]
    fn events_serialize_with_stable_tags() {
        let json = serde_json::to_string(&BroadcastEvent::Connection).expect("serialize");
        assert!(json.contains("\"connection\""));

        let json = serde_json::to_string(&BroadcastEvent::MessageStream {
            message: GroupMessage {
                sender: "system".to_string(),
                content: "ping".to_string(),
                sent_at_ns: 1,
            },
        })
        .expect("serialize");
        assert!(json.contains("\"newMessageStream\""));
    }
}
