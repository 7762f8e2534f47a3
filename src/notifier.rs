//! Room-based push notification fan-out.
//!
//! Rooms are named `user_{id}`, `technician_{id}` and `request_{id}`.
//! Subscribers attach through server-sent event streams; publishers fire and
//! forget. Delivery is best-effort and at-most-once per connection: the
//! database is the source of truth and every push is only a hint that a fresh
//! read is worthwhile.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of each room's broadcast channel. A slow subscriber that falls
/// more than this many events behind loses the oldest ones, which is
/// acceptable for hint-only delivery.
const ROOM_CAPACITY: usize = 64;

/// One push event as delivered to a room subscriber.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub event: String,
    pub payload: Value,
}

impl PushEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        PushEvent {
            event: event.into(),
            payload,
        }
    }
}

/// Process-wide pub/sub registry of rooms.
#[derive(Clone, Default)]
pub struct Notifier {
    rooms: Arc<DashMap<String, broadcast::Sender<PushEvent>>>,
}

pub fn user_room(user_id: i64) -> String {
    format!("user_{user_id}")
}

pub fn technician_room(technician_id: i64) -> String {
    format!("technician_{technician_id}")
}

pub fn request_room(request_id: i64) -> String {
    format!("request_{request_id}")
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes the caller's connection to a named room, creating the room
    /// on first join.
    pub fn join(&self, room: &str) -> broadcast::Receiver<PushEvent> {
        self.rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .subscribe()
    }

    pub fn join_user(&self, user_id: i64) -> broadcast::Receiver<PushEvent> {
        self.join(&user_room(user_id))
    }

    pub fn join_technician(&self, technician_id: i64) -> broadcast::Receiver<PushEvent> {
        self.join(&technician_room(technician_id))
    }

    pub fn join_request(&self, request_id: i64) -> broadcast::Receiver<PushEvent> {
        self.join(&request_room(request_id))
    }

    /// Publishes into one room. Rooms with no live subscriber are dropped
    /// from the registry; a failed send never surfaces to the caller.
    pub fn publish(&self, room: &str, event: &str, payload: Value) {
        let Some(sender) = self.rooms.get(room).map(|entry| entry.value().clone()) else {
            return;
        };
        if sender.send(PushEvent::new(event, payload)).is_err() {
            // Last subscriber disconnected; forget the room.
            self.rooms
                .remove_if(room, |_, sender| sender.receiver_count() == 0);
        }
    }

    /// Delivers to `user_{id}`, mirroring into the request watch room when
    /// the payload names a request.
    pub fn notify_user(&self, user_id: i64, event: &str, payload: Value) {
        if let Some(request_id) = payload.get("requestId").and_then(Value::as_i64) {
            self.publish(&request_room(request_id), event, payload.clone());
        }
        self.publish(&user_room(user_id), event, payload);
    }

    pub fn notify_technician(&self, technician_id: i64, event: &str, payload: Value) {
        self.publish(&technician_room(technician_id), event, payload);
    }

    pub fn notify_request_watchers(&self, request_id: i64, event: &str, payload: Value) {
        self.publish(&request_room(request_id), event, payload);
    }

    /// Delivers to every connected room (admin dashboards).
    pub fn broadcast(&self, event: &str, payload: Value) {
        for entry in self.rooms.iter() {
            let _ = entry.value().send(PushEvent::new(event, payload.clone()));
        }
    }

    #[cfg(test)]
    fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_join_then_publish_delivers() {
        let notifier = Notifier::new();
        let mut rx = notifier.join_technician(2);
        notifier.notify_technician(2, "job_offer", json!({"requestId": 1}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "job_offer");
        assert_eq!(event.payload, json!({"requestId": 1}));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let notifier = Notifier::new();
        notifier.notify_user(1, "job:status_update", json!({"status": "cancelled"}));
        assert_eq!(notifier.room_count(), 0);
    }

    #[tokio::test]
    async fn test_user_payload_mirrors_into_request_room() {
        let notifier = Notifier::new();
        let mut user_rx = notifier.join_user(1);
        let mut watcher_rx = notifier.join_request(7);

        notifier.notify_user(1, "job:assigned", json!({"requestId": 7, "technicianId": 2}));

        assert_eq!(user_rx.recv().await.unwrap().event, "job:assigned");
        assert_eq!(watcher_rx.recv().await.unwrap().event, "job:assigned");
    }

    #[tokio::test]
    async fn test_payload_without_request_id_stays_in_user_room() {
        let notifier = Notifier::new();
        let mut watcher_rx = notifier.join_request(7);
        notifier.notify_user(1, "payment_completed", json!({"amount": "550"}));
        assert!(watcher_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnected_room_is_dropped() {
        let notifier = Notifier::new();
        let rx = notifier.join_user(9);
        drop(rx);
        notifier.publish(&user_room(9), "heartbeat", json!({}));
        assert_eq!(notifier.room_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_rooms() {
        let notifier = Notifier::new();
        let mut a = notifier.join_user(1);
        let mut b = notifier.join_technician(2);
        notifier.broadcast("admin:payment_update", json!({"paymentId": 5}));
        assert_eq!(a.recv().await.unwrap().event, "admin:payment_update");
        assert_eq!(b.recv().await.unwrap().event, "admin:payment_update");
    }
}
