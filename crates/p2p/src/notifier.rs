//! Node-wide notification fan-out.
//!
//! The state machine pushes block and transaction payloads onto the
//! ingestion queue and publishes connection-level events to subscribers.
//! Both paths are bounded: a full ingestion queue or a slow subscriber
//! loses the newest item rather than stalling the reactor.

use std::sync::{Arc, Mutex};

use flume as chan;
use tracing::{debug, warn};

use gold_types::{IngestMessage, NodeEvent};

/// Default capacity of a subscriber channel.
const SUBSCRIBER_CAPACITY: usize = 1000;

/// Publishes protocol output to the rest of the node.
#[derive(Clone)]
pub struct Notifier {
    ingest: chan::Sender<IngestMessage>,
    subscribers: Arc<Mutex<Vec<chan::Sender<NodeEvent>>>>,
}

impl Notifier {
    /// Create a notifier pushing ingestion items onto the given channel.
    pub fn new(ingest: chan::Sender<IngestMessage>) -> Self {
        Self {
            ingest,
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new event subscriber.
    pub fn subscribe(&self) -> chan::Receiver<NodeEvent> {
        let (sender, receiver) = chan::bounded(SUBSCRIBER_CAPACITY);

        self.subscribers
            .lock()
            .expect("lock is not poisoned")
            .push(sender);

        receiver
    }

    /// Queue a payload for ingestion. Dropped if the queue is full.
    pub fn ingest(&self, msg: IngestMessage) {
        if let Err(chan::TrySendError::Full(msg)) = self.ingest.try_send(msg) {
            warn!(target: "p2p", "Ingestion queue is full, dropping {:?}", msg);
        }
    }

    /// Publish an event to all subscribers. Subscribers that fell behind
    /// miss the event; disconnected ones are pruned.
    pub fn notify(&self, event: NodeEvent) {
        let mut subscribers = self.subscribers.lock().expect("lock is not poisoned");

        subscribers.retain(|sub| match sub.try_send(event.clone()) {
            Ok(()) => true,
            Err(chan::TrySendError::Full(_)) => {
                debug!(target: "p2p", "Subscriber queue is full, dropping event");
                true
            }
            Err(chan::TrySendError::Disconnected(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn event() -> NodeEvent {
        NodeEvent::Disconnected {
            addr: SocketAddr::from(([10, 0, 0, 1], 8121)),
            reason: "test".to_owned(),
        }
    }

    #[test]
    fn test_all_subscribers_receive_events() {
        let (ingest, _) = chan::unbounded();
        let notifier = Notifier::new(ingest);

        let a = notifier.subscribe();
        let b = notifier.subscribe();

        notifier.notify(event());

        assert!(matches!(a.try_recv(), Ok(NodeEvent::Disconnected { .. })));
        assert!(matches!(b.try_recv(), Ok(NodeEvent::Disconnected { .. })));
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let (ingest, _) = chan::unbounded();
        let notifier = Notifier::new(ingest);

        drop(notifier.subscribe());
        notifier.notify(event());

        assert!(notifier
            .subscribers
            .lock()
            .expect("lock is not poisoned")
            .is_empty());
    }
}
