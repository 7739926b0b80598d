//! Event bus routing helpers.

use crate::payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::Sender;
use tokio_stream::wrappers::BroadcastStream;

/// Stream wrapper used by subscribers.
pub type EventStream = BroadcastStream<EventEnvelope>;

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    replay: Arc<Mutex<VecDeque<EventEnvelope>>>,
    replay_capacity: usize,
    next_id: Arc<Mutex<EventId>>,
}

impl EventBus {
    /// Construct a bus with a custom replay capacity.
    ///
    /// # Panics
    ///
    /// Panics if `replay_capacity` is zero.
    #[must_use]
    pub fn with_capacity(replay_capacity: usize) -> Self {
        assert!(replay_capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(replay_capacity);
        Self {
            sender,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(replay_capacity))),
            replay_capacity,
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// Construct a bus with the default replay capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Subscribe to events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Publish a new event to all subscribers, ignoring the absence of
    /// listeners. The event is always recorded in the replay ring.
    pub fn send(&self, event: Event) -> EventId {
        let envelope = self.record(event);
        let id = envelope.id;
        let _ = self.sender.send(envelope);
        id
    }

    /// Last event id observed in the replay buffer.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.lock_replay().back().map(|env| env.id)
    }

    /// Collect a backlog of events emitted after the specified id.
    #[must_use]
    pub fn backlog_since(&self, id: EventId) -> Vec<EventEnvelope> {
        let replay = self.lock_replay();
        replay.iter().filter(|env| env.id > id).cloned().collect()
    }

    fn record(&self, event: Event) -> EventEnvelope {
        let mut next = self
            .next_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = *next;
        *next = next.saturating_add(1);
        drop(next);

        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        let mut replay = self.lock_replay();
        if replay.len() == self.replay_capacity {
            let _ = replay.pop_front();
        }
        replay.push_back(envelope.clone());
        envelope
    }

    fn lock_replay(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        self.replay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::SaveOperation;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::task;
    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

    fn reloaded(schema: &str) -> Event {
        Event::ConfigReloaded {
            schema: schema.into(),
        }
    }

    #[tokio::test]
    async fn publish_and_replay_from_id() {
        let bus = EventBus::with_capacity(4);
        let first = bus.send(Event::ConfigRegistered {
            schema: "editor".into(),
        });
        let second = bus.send(reloaded("editor"));

        assert_eq!(bus.last_event_id(), Some(second));
        let backlog = bus.backlog_since(first);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, second);
    }

    #[tokio::test]
    async fn replay_ring_drops_oldest_entries() {
        let bus = EventBus::with_capacity(2);
        for i in 0..5 {
            let _ = bus.send(reloaded(&format!("schema-{i}")));
        }
        let backlog = bus.backlog_since(0);
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].id, 4);
        assert_eq!(backlog[1].id, 5);
    }

    #[tokio::test]
    async fn subscribe_streams_events() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        let id = bus.send(Event::SaveCompleted {
            schema: "editor".into(),
            operation: SaveOperation::Settings,
        });
        let envelope = stream
            .next()
            .await
            .expect("stream item")
            .expect("broadcast ok");
        assert_eq!(envelope.id, id);
        assert!(matches!(envelope.event, Event::SaveCompleted { .. }));
    }

    #[tokio::test]
    async fn load_test_does_not_stall_publishers() {
        let bus = Arc::new(EventBus::with_capacity(512));
        let mut stream = bus.subscribe();

        let publisher = {
            let bus = bus.clone();
            task::spawn(async move {
                for i in 0..500 {
                    let publish_bus = bus.clone();
                    timeout(PUBLISH_TIMEOUT, async move {
                        let _ = publish_bus.send(reloaded(&format!("schema-{i}")));
                    })
                    .await
                    .expect("publish timed out");
                }
            })
        };

        let consumer = task::spawn(async move {
            let mut ids = HashSet::new();
            while ids.len() < 500 {
                match stream.next().await {
                    Some(Ok(event)) => {
                        ids.insert(event.id);
                    }
                    Some(Err(_)) => {}
                    None => break,
                }
            }
            ids
        });

        publisher.await.expect("publisher task panicked");
        let ids = consumer.await.expect("consumer task panicked");
        assert_eq!(ids.len(), 500);
    }
}
