//! Helpers for awaiting registry events.

use std::time::Duration;

use anyhow::{Result, anyhow};
use latchkey_events::{Event, EventBus, EventId, EventStream};
use tokio_stream::StreamExt;

const REPLAY_POLL: Duration = Duration::from_millis(5);

/// Wait for the first event accepted by `matches`, skipping others.
///
/// # Errors
///
/// Returns an error if the stream ends or nothing matches within `limit`.
pub async fn next_matching<F>(stream: &mut EventStream, limit: Duration, mut matches: F) -> Result<Event>
where
    F: FnMut(&Event) -> bool,
{
    let search = async {
        while let Some(item) = stream.next().await {
            match item {
                Ok(envelope) if matches(&envelope.event) => return Ok(envelope.event),
                Ok(_) => {}
                Err(err) => return Err(anyhow!("event stream lagged: {err}")),
            }
        }
        Err(anyhow!("event stream closed"))
    };
    tokio::time::timeout(limit, search)
        .await
        .map_err(|_| anyhow!("timed out waiting for event"))?
}

/// Wait for an event of the given kind (see [`Event::kind`]).
///
/// # Errors
///
/// Returns an error if the stream ends or no such event arrives in time.
pub async fn next_of_kind(stream: &mut EventStream, limit: Duration, kind: &str) -> Result<Event> {
    next_matching(stream, limit, |event| event.kind() == kind).await
}

/// Id of the newest event on `bus`; later events compare greater.
#[must_use]
pub fn mark(bus: &EventBus) -> EventId {
    bus.last_event_id().unwrap_or(0)
}

/// Events published on `bus` after `since`, oldest first.
#[must_use]
pub fn published_since(bus: &EventBus, since: EventId) -> Vec<Event> {
    bus.backlog_since(since)
        .into_iter()
        .map(|envelope| envelope.event)
        .collect()
}

/// Wait for an event of `kind` published after `since`. Reads the replay
/// ring, so events emitted before the wait starts are still found.
///
/// # Errors
///
/// Returns an error if no such event appears within `limit`.
pub async fn replayed_of_kind(
    bus: &EventBus,
    since: EventId,
    limit: Duration,
    kind: &str,
) -> Result<Event> {
    let search = async {
        loop {
            if let Some(event) = published_since(bus, since)
                .into_iter()
                .find(|event| event.kind() == kind)
            {
                return event;
            }
            tokio::time::sleep(REPLAY_POLL).await;
        }
    };
    tokio::time::timeout(limit, search)
        .await
        .map_err(|_| anyhow!("timed out waiting for replayed {kind} event"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_events::EventBus;

    #[tokio::test]
    async fn skips_non_matching_events() -> Result<()> {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        bus.send(Event::ConfigRegistered {
            schema: "a".into(),
        });
        bus.send(Event::ConfigReloaded {
            schema: "a".into(),
        });
        let event = next_of_kind(&mut stream, Duration::from_secs(1), "config_reloaded").await?;
        assert_eq!(event.schema(), "a");
        Ok(())
    }

    #[tokio::test]
    async fn replay_finds_events_sent_before_waiting() -> Result<()> {
        let bus = EventBus::new();
        bus.send(Event::ConfigRegistered {
            schema: "a".into(),
        });
        let since = mark(&bus);
        bus.send(Event::ConfigReloaded {
            schema: "b".into(),
        });

        let event = replayed_of_kind(&bus, since, Duration::from_secs(1), "config_reloaded").await?;
        assert_eq!(event.schema(), "b");
        assert_eq!(published_since(&bus, since).len(), 1);
        assert!(
            replayed_of_kind(&bus, since, Duration::from_millis(30), "config_registered")
                .await
                .is_err()
        );
        Ok(())
    }

    #[tokio::test]
    async fn times_out_without_events() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        assert!(next_of_kind(&mut stream, Duration::from_millis(30), "save_completed").await.is_err());
    }
}
