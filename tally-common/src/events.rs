//! Platform notifications and the bus that carries them
//!
//! The platform announces newly created check-ins and users. Delivery is
//! at-least-once with no ordering guarantee across users; consumers must be
//! idempotent.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::CheckInEvent;

/// Payload of a "user created" notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedEvent {
    pub uid: String,
    #[serde(default)]
    pub is_anonymous: Option<bool>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl UserCreatedEvent {
    pub fn new(uid: impl Into<String>, is_anonymous: bool) -> Self {
        Self {
            uid: uid.into(),
            is_anonymous: Some(is_anonymous),
            display_name: None,
        }
    }
}

/// Notification delivered by the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PlatformNotification {
    CheckInCreated(CheckInEvent),
    UserCreated(UserCreatedEvent),
}

impl PlatformNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            PlatformNotification::CheckInCreated(_) => "check_in_created",
            PlatformNotification::UserCreated(_) => "user_created",
        }
    }
}

/// Broadcast bus for platform notifications
///
/// Uses tokio::broadcast internally: publishing never blocks on slow
/// subscribers, and a subscriber that falls behind observes `Lagged`.
/// Publishers check `is_saturated` first and handle the notification
/// themselves instead of overwriting one nobody has received.
#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<PlatformNotification>,
    capacity: usize,
}

impl NotificationBus {
    /// Creates a new bus buffering up to `capacity` notifications
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PlatformNotification> {
        self.tx.subscribe()
    }

    /// Publish a notification
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn publish(
        &self,
        notification: PlatformNotification,
    ) -> Result<usize, broadcast::error::SendError<PlatformNotification>> {
        self.tx.send(notification)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// True when the slowest subscriber already has `capacity` notifications
    /// pending, so the next publish would evict one it has not received
    pub fn is_saturated(&self) -> bool {
        self.tx.len() >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = NotificationBus::new(8);
        let mut rx = bus.subscribe();

        let sent = PlatformNotification::UserCreated(UserCreatedEvent::new("u1", false));
        assert_eq!(bus.publish(sent.clone()).unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), sent);
    }

    #[test]
    fn test_publish_without_subscribers_fails() {
        let bus = NotificationBus::new(8);
        let result = bus.publish(PlatformNotification::UserCreated(UserCreatedEvent::new(
            "u1", true,
        )));
        assert!(result.is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_saturation_tracks_undelivered_backlog() {
        let bus = NotificationBus::new(2);
        let mut rx = bus.subscribe();
        let notification = || PlatformNotification::UserCreated(UserCreatedEvent::new("u1", false));

        bus.publish(notification()).unwrap();
        assert!(!bus.is_saturated());
        bus.publish(notification()).unwrap();
        assert!(bus.is_saturated());

        rx.recv().await.unwrap();
        assert!(!bus.is_saturated());
    }

    #[test]
    fn test_notification_json_shape() {
        let json = serde_json::json!({
            "type": "user_created",
            "payload": { "uid": "u9", "isAnonymous": true }
        });
        let parsed: PlatformNotification = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind(), "user_created");
        match parsed {
            PlatformNotification::UserCreated(event) => {
                assert_eq!(event.uid, "u9");
                assert_eq!(event.is_anonymous, Some(true));
            }
            other => panic!("unexpected notification: {:?}", other),
        }
    }
}
