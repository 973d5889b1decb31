//! Broadcast bus that fans run events out to subscribers.

use crate::payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId};
use chrono::Utc;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::Sender;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

/// Stream handed to subscribers. A subscriber that falls behind the channel
/// sees [`BroadcastStreamRecvError::Lagged`] and keeps receiving.
pub type EventStream =
    Pin<Box<dyn Stream<Item = Result<EventEnvelope, BroadcastStreamRecvError>> + Send>>;

/// Shared report sink built on top of `tokio::broadcast`.
///
/// Publishing never blocks and never fails: when nobody is subscribed the
/// event only lands in the replay ring.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    replay: Arc<Mutex<VecDeque<EventEnvelope>>>,
    replay_capacity: usize,
    next_id: Arc<Mutex<EventId>>,
}

impl EventBus {
    /// Construct a bus with a custom replay capacity.
    #[must_use]
    pub fn with_capacity(replay_capacity: usize) -> Self {
        let capacity = replay_capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            replay_capacity: capacity,
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// Construct a bus with the default replay capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Subscribe to the bus.
    ///
    /// With `last_event_id`, the new stream first yields the buffered events
    /// after that id and then live events, each exactly once. Other
    /// subscribers are unaffected.
    #[must_use]
    pub fn subscribe(&self, last_event_id: Option<EventId>) -> EventStream {
        // Subscribe before reading the ring so nothing published in between is lost.
        let live = BroadcastStream::new(self.sender.subscribe());
        let Some(last) = last_event_id else {
            return Box::pin(live);
        };
        let backlog = self.backlog_since(last);
        let replayed_up_to = backlog.last().map_or(last, |env| env.id);
        let live = live.filter(move |item| !matches!(item, Ok(env) if env.id <= replayed_up_to));
        Box::pin(
            tokio_stream::iter(backlog.into_iter().map(Ok::<_, BroadcastStreamRecvError>))
                .chain(live),
        )
    }

    /// Publish an event to all subscribers and return its id.
    pub fn publish(&self, event: Event) -> EventId {
        let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *next;
        *next = next.saturating_add(1);
        drop(next);

        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        {
            let mut replay = self.lock_replay();
            if replay.len() == self.replay_capacity {
                let _ = replay.pop_front();
            }
            replay.push_back(envelope.clone());
        }
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

    fn lock_replay(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        self.replay.lock().unwrap_or_else(PoisonError::into_inner)
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
    use crate::payloads::FailureStage;
    use std::error::Error;
    use tokio_stream::StreamExt;
    use uuid::Uuid;

    async fn next_id(stream: &mut EventStream) -> Result<EventId, Box<dyn Error>> {
        Ok(stream.next().await.ok_or("stream closed")??.id)
    }

    fn aborted(reason: &str) -> Event {
        Event::RunAborted {
            run_id: Uuid::nil(),
            reason: reason.into(),
        }
    }

    #[test]
    fn publish_assigns_sequential_ids_and_tracks_backlog() {
        let bus = EventBus::with_capacity(4);
        let first = bus.publish(aborted("one"));
        let second = bus.publish(aborted("two"));

        assert_eq!(second, first + 1);
        assert_eq!(bus.last_event_id(), Some(second));
        let backlog = bus.backlog_since(first);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, second);
    }

    #[test]
    fn replay_ring_drops_oldest_when_full() {
        let bus = EventBus::with_capacity(2);
        for idx in 0..5 {
            let _ = bus.publish(aborted(&idx.to_string()));
        }
        let backlog = bus.backlog_since(0);
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].id, 4);
        assert_eq!(backlog[1].id, 5);
    }

    #[tokio::test]
    async fn subscribe_streams_new_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::new();
        let mut stream = bus.subscribe(None);
        let id = bus.publish(Event::TaskFailed {
            path: "/in/a.jpg".into(),
            stage: FailureStage::Save,
            kind: "io".into(),
            message: "disk full".into(),
        });
        let envelope = stream.next().await.ok_or("stream closed")??;
        assert_eq!(envelope.id, id);
        assert!(matches!(envelope.event, Event::TaskFailed { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn resuming_subscriber_gets_backlog_then_live_events() -> Result<(), Box<dyn Error>> {
        let bus = EventBus::new();
        let mut existing = bus.subscribe(None);
        let first = bus.publish(aborted("one"));
        let second = bus.publish(aborted("two"));

        let mut resumed = bus.subscribe(Some(first));
        let third = bus.publish(aborted("three"));

        assert_eq!(next_id(&mut resumed).await?, second);
        assert_eq!(next_id(&mut resumed).await?, third);

        // The existing subscriber sees every event once; replay is private to
        // the resumed stream.
        let fourth = bus.publish(aborted("four"));
        for expected in [first, second, third, fourth] {
            assert_eq!(next_id(&mut existing).await?, expected);
        }
        assert_eq!(next_id(&mut resumed).await?, fourth);
        Ok(())
    }

    #[tokio::test]
    async fn resuming_from_the_latest_id_only_streams_new_events() -> Result<(), Box<dyn Error>> {
        let bus = EventBus::new();
        let last = bus.publish(aborted("before"));
        let mut resumed = bus.subscribe(bus.last_event_id());
        assert_eq!(bus.last_event_id(), Some(last));

        let next = bus.publish(aborted("after"));
        assert_eq!(next_id(&mut resumed).await?, next);
        Ok(())
    }
}
