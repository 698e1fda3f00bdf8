use uuid::Uuid;

use crate::pii::Masked;

/// A ride was offered to a specific driver; the delivery channel should ping
/// that driver with accept/decline actions before `expires_at`.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct RideOfferEvent {
    pub ride_id: Uuid,
    pub offer_id: Uuid,
    pub driver_id: Uuid,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub dropoff_lat: f64,
    pub dropoff_lng: f64,
    /// Straight-line distance from the driver to the pickup point.
    pub pickup_distance_km: f64,
    /// Estimated trip distance pickup → dropoff.
    pub trip_distance_km: f64,
    pub estimated_fare: f64,
    pub payment_method: String,
    pub expires_at: i64,
    pub offered_at: i64,
}

/// The ride moved to a new status. `fare`/`commission` are populated on
/// completion; `passenger_contact` on acceptance (when the passenger shared
/// a phone number) so the driver channel can offer a call action.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct RideUpdateEvent {
    pub ride_id: Uuid,
    pub status: String,
    pub driver_id: Option<Uuid>,
    pub fare: Option<f64>,
    pub commission: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passenger_contact: Option<Masked<String>>,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct RideCancelledEvent {
    pub ride_id: Uuid,
    pub cancelled_by: String,
    /// Driver that held the ride (or its pending offer) when it was cancelled.
    pub driver_id: Option<Uuid>,
    pub timestamp: i64,
}

/// Envelope handed to the notification channel. The engine only emits these
/// facts; rendering and delivery (bot push, websocket, SMS) belong to the
/// subscriber.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(tag = "event", content = "payload")]
pub enum RideEvent {
    #[serde(rename = "ride:offer")]
    Offer(RideOfferEvent),
    #[serde(rename = "ride:update")]
    Update(RideUpdateEvent),
    #[serde(rename = "ride:cancelled")]
    Cancelled(RideCancelledEvent),
}

impl RideEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RideEvent::Offer(_) => "ride:offer",
            RideEvent::Update(_) => "ride:update",
            RideEvent::Cancelled(_) => "ride:cancelled",
        }
    }

    pub fn ride_id(&self) -> Uuid {
        match self {
            RideEvent::Offer(e) => e.ride_id,
            RideEvent::Update(e) => e.ride_id,
            RideEvent::Cancelled(e) => e.ride_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_envelope_is_tagged_by_kind() {
        let event = RideEvent::Cancelled(RideCancelledEvent {
            ride_id: Uuid::new_v4(),
            cancelled_by: "passenger".to_string(),
            driver_id: None,
            timestamp: 0,
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "ride:cancelled");
        assert_eq!(event.kind(), "ride:cancelled");
    }

    #[test]
    fn update_event_omits_absent_contact() {
        let event = RideUpdateEvent {
            ride_id: Uuid::new_v4(),
            status: "SEARCHING".to_string(),
            driver_id: None,
            fare: None,
            commission: None,
            passenger_contact: None,
            timestamp: 42,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("passenger_contact").is_none());
    }
}
