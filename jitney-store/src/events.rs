use async_trait::async_trait;
use jitney_core::RideNotifier;
use jitney_shared::RideEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Fan-out bus for engine events. External transports (bot push, websocket,
/// SSE) subscribe and deliver; the engine only publishes facts.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<RideEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RideEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl RideNotifier for BroadcastNotifier {
    async fn notify(&self, event: RideEvent) {
        // No subscribers is not an error; delivery is best-effort and never
        // blocks or rolls back the state change behind the event.
        if let Err(e) = self.tx.send(event) {
            debug!("No subscribers for ride event: {}", e.0.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitney_shared::{RideCancelledEvent, RideEvent};
    use uuid::Uuid;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let notifier = BroadcastNotifier::new(16);
        let mut rx = notifier.subscribe();

        let ride_id = Uuid::new_v4();
        notifier
            .notify(RideEvent::Cancelled(RideCancelledEvent {
                ride_id,
                cancelled_by: "passenger".to_string(),
                driver_id: None,
                timestamp: 0,
            }))
            .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.ride_id(), ride_id);
        assert_eq!(received.kind(), "ride:cancelled");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_swallowed() {
        let notifier = BroadcastNotifier::new(16);
        // Must not panic or error.
        notifier
            .notify(RideEvent::Cancelled(RideCancelledEvent {
                ride_id: Uuid::new_v4(),
                cancelled_by: "admin".to_string(),
                driver_id: None,
                timestamp: 0,
            }))
            .await;
    }
}
