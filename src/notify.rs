use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for live change feeds, one channel per semester. Advisor
/// dashboards and open invite pages watch the semester they render.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a semester's events. Creates the channel if needed.
    pub fn subscribe(&self, semester_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(semester_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, semester_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&semester_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when the semester is deleted).
    pub fn remove(&self, semester_id: &Ulid) {
        self.channels.remove(semester_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        let mut rx = hub.subscribe(sid);

        let event = Event::SlotCreated {
            id: Ulid::new(),
            semester_id: sid,
            span: Span::slot_at(10_000),
        };
        hub.send(sid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        // No subscriber — should not panic
        hub.send(sid, &Event::SemesterDeleted { id: sid });
    }

    #[tokio::test]
    async fn channels_are_isolated_per_semester() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);
        let _rx_b = hub.subscribe(b);

        hub.send(b, &Event::SemesterDeleted { id: b });
        assert!(rx_a.try_recv().is_err());
    }
}
