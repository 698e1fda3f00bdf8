use chrono::{DateTime, Utc};
use jitney_pricing::{FareQuote, PricingPolicy};
use jitney_shared::Masked;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::geo::GeoPoint;

/// Ride status in the lifecycle. The transition helpers on [`Ride`] are the
/// single source of truth for which moves are legal; call sites never compare
/// status strings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Searching,
    Offered,
    Accepted,
    Arrived,
    Started,
    Completed,
    Cancelled,
    Unmatched,
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Searching => "SEARCHING",
            RideStatus::Offered => "OFFERED",
            RideStatus::Accepted => "ACCEPTED",
            RideStatus::Arrived => "ARRIVED",
            RideStatus::Started => "STARTED",
            RideStatus::Completed => "COMPLETED",
            RideStatus::Cancelled => "CANCELLED",
            RideStatus::Unmatched => "UNMATCHED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RideStatus::Completed | RideStatus::Cancelled | RideStatus::Unmatched
        )
    }

    /// Cancellation is allowed any time before the trip physically starts.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            RideStatus::Searching | RideStatus::Offered | RideStatus::Accepted | RideStatus::Arrived
        )
    }
}

impl FromStr for RideStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SEARCHING" => Ok(RideStatus::Searching),
            "OFFERED" => Ok(RideStatus::Offered),
            "ACCEPTED" => Ok(RideStatus::Accepted),
            "ARRIVED" => Ok(RideStatus::Arrived),
            "STARTED" => Ok(RideStatus::Started),
            "COMPLETED" => Ok(RideStatus::Completed),
            "CANCELLED" => Ok(RideStatus::Cancelled),
            "UNMATCHED" => Ok(RideStatus::Unmatched),
            other => Err(format!("unknown ride status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    Card,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "CASH",
            PaymentMethod::Card => "CARD",
        }
    }
}

impl Default for PaymentMethod {
    fn default() -> Self {
        PaymentMethod::Cash
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CASH" => Ok(PaymentMethod::Cash),
            "CARD" => Ok(PaymentMethod::Card),
            other => Err(format!("unknown payment method: {other}")),
        }
    }
}

/// A ranked driver waiting their turn in a ride's offer queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QueuedCandidate {
    pub driver_id: Uuid,
    /// Straight-line distance driver -> pickup, captured at ranking time.
    pub pickup_distance_km: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("Invalid transition from {from:?} on {event}")]
    InvalidTransition {
        from: RideStatus,
        event: &'static str,
    },

    #[error("Ride is not offered to this driver")]
    NotOfferedToDriver,

    #[error("Offer expired")]
    OfferExpired,

    #[error("Driver is not assigned to this ride")]
    NotAssignedDriver,
}

/// The single source of truth for a trip request.
///
/// All status mutation goes through the transition helpers below; the record
/// only becomes authoritative once the store's conditional update commits it,
/// which is what makes each transition exactly-once under races.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub passenger_id: Uuid,
    /// Phone number shared by the passenger for the driver channel, masked in
    /// logs.
    pub passenger_contact: Option<Masked<String>>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub payment_method: PaymentMethod,
    pub estimated_distance_km: f64,
    /// Quote computed at creation from the snapshot policy.
    pub fare: FareQuote,
    /// Policy snapshot taken at creation; later tariff changes never alter
    /// this ride's pricing.
    pub policy: PricingPolicy,
    pub status: RideStatus,
    /// Driver currently holding the live offer, if any. At most one non-null
    /// offered driver with an unexpired offer exists at a time.
    pub offered_driver: Option<Uuid>,
    pub offer_expires_at: Option<DateTime<Utc>>,
    /// Set once at acceptance, immutable until the ride terminates.
    pub assigned_driver: Option<Uuid>,
    /// Remaining ranked candidates, head next to be offered.
    pub candidate_queue: Vec<QueuedCandidate>,
    /// Odometer distance reported at completion.
    pub final_distance_km: Option<f64>,
    /// Fare recomputed over the final distance with the snapshot policy.
    pub final_fare: Option<FareQuote>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Ride {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        passenger_id: Uuid,
        passenger_contact: Option<String>,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        payment_method: PaymentMethod,
        estimated_distance_km: f64,
        fare: FareQuote,
        policy: PricingPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            passenger_id,
            passenger_contact: passenger_contact.map(Masked::new),
            pickup,
            dropoff,
            payment_method,
            estimated_distance_km,
            fare,
            policy,
            status: RideStatus::Searching,
            offered_driver: None,
            offer_expires_at: None,
            assigned_driver: None,
            candidate_queue: Vec::new(),
            final_distance_km: None,
            final_fare: None,
            created_at: Utc::now(),
            accepted_at: None,
            arrived_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    /// Transition: Searching -> Offered, recording the live offer.
    pub fn begin_offer(
        &mut self,
        driver_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != RideStatus::Searching {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                event: "offer issued",
            });
        }

        self.status = RideStatus::Offered;
        self.offered_driver = Some(driver_id);
        self.offer_expires_at = Some(expires_at);
        Ok(())
    }

    /// Transition: Offered -> Accepted. Guards: the offer belongs to this
    /// driver and has not expired. The assigned driver is fixed here and
    /// never changes until the ride terminates.
    pub fn accept(&mut self, driver_id: Uuid, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != RideStatus::Offered {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                event: "driver accepts",
            });
        }
        if self.offered_driver != Some(driver_id) {
            return Err(TransitionError::NotOfferedToDriver);
        }
        if matches!(self.offer_expires_at, Some(expiry) if now > expiry) {
            return Err(TransitionError::OfferExpired);
        }

        self.status = RideStatus::Accepted;
        self.assigned_driver = Some(driver_id);
        self.offered_driver = None;
        self.offer_expires_at = None;
        self.accepted_at = Some(now);
        Ok(())
    }

    /// Transition: Offered -> Searching, on rejection or timeout of the
    /// current offer.
    pub fn release_offer(&mut self, driver_id: Uuid) -> Result<(), TransitionError> {
        if self.status != RideStatus::Offered {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                event: "offer released",
            });
        }
        if self.offered_driver != Some(driver_id) {
            return Err(TransitionError::NotOfferedToDriver);
        }

        self.status = RideStatus::Searching;
        self.offered_driver = None;
        self.offer_expires_at = None;
        Ok(())
    }

    /// Transition: Searching -> Unmatched, when the candidate queue runs dry.
    pub fn exhaust(&mut self) -> Result<(), TransitionError> {
        if self.status != RideStatus::Searching {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                event: "queue exhausted",
            });
        }

        self.status = RideStatus::Unmatched;
        Ok(())
    }

    /// Transition: any pre-start state -> Cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.is_cancellable() {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                event: "cancel requested",
            });
        }

        self.status = RideStatus::Cancelled;
        self.offered_driver = None;
        self.offer_expires_at = None;
        self.cancelled_at = Some(now);
        Ok(())
    }

    /// Transition: Accepted -> Arrived. The arrival tap is optional; drivers
    /// may go straight to start.
    pub fn arrive(&mut self, driver_id: Uuid, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.assigned_driver != Some(driver_id) {
            return Err(TransitionError::NotAssignedDriver);
        }
        if self.status != RideStatus::Accepted {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                event: "driver arrives",
            });
        }

        self.status = RideStatus::Arrived;
        self.arrived_at = Some(now);
        Ok(())
    }

    /// Transition: Accepted/Arrived -> Started.
    pub fn start(&mut self, driver_id: Uuid, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.assigned_driver != Some(driver_id) {
            return Err(TransitionError::NotAssignedDriver);
        }
        if !matches!(self.status, RideStatus::Accepted | RideStatus::Arrived) {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                event: "driver starts",
            });
        }

        self.status = RideStatus::Started;
        self.started_at = Some(now);
        Ok(())
    }

    /// Transition: Started -> Completed, recording the final distance and the
    /// fare recomputed over it with the ride's snapshot policy.
    pub fn complete(
        &mut self,
        driver_id: Uuid,
        final_distance_km: f64,
        final_fare: FareQuote,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.assigned_driver != Some(driver_id) {
            return Err(TransitionError::NotAssignedDriver);
        }
        if self.status != RideStatus::Started {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                event: "driver completes",
            });
        }

        self.status = RideStatus::Completed;
        self.final_distance_km = Some(final_distance_km);
        self.final_fare = Some(final_fare);
        self.completed_at = Some(now);
        Ok(())
    }
}
