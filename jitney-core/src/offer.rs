use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Outcome of an offer. Resolution is terminal: an offer never leaves a
/// non-`Pending` outcome, and exactly one offer per ride may resolve
/// `Accepted`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferOutcome {
    Pending,
    Accepted,
    Rejected,
    TimedOut,
    /// The ride was cancelled while the offer was still pending.
    Withdrawn,
}

impl OfferOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferOutcome::Pending => "PENDING",
            OfferOutcome::Accepted => "ACCEPTED",
            OfferOutcome::Rejected => "REJECTED",
            OfferOutcome::TimedOut => "TIMED_OUT",
            OfferOutcome::Withdrawn => "WITHDRAWN",
        }
    }

    pub fn is_resolved(&self) -> bool {
        *self != OfferOutcome::Pending
    }
}

impl FromStr for OfferOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OfferOutcome::Pending),
            "ACCEPTED" => Ok(OfferOutcome::Accepted),
            "REJECTED" => Ok(OfferOutcome::Rejected),
            "TIMED_OUT" => Ok(OfferOutcome::TimedOut),
            "WITHDRAWN" => Ok(OfferOutcome::Withdrawn),
            other => Err(format!("unknown offer outcome: {other}")),
        }
    }
}

/// A time-bounded proposal of a specific ride to a specific driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    /// Driver -> pickup distance at offer time, carried into the
    /// notification payload.
    pub pickup_distance_km: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub outcome: OfferOutcome,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Offer {
    pub fn new(
        ride_id: Uuid,
        driver_id: Uuid,
        pickup_distance_km: f64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ride_id,
            driver_id,
            pickup_distance_km,
            created_at: Utc::now(),
            expires_at,
            outcome: OfferOutcome::Pending,
            resolved_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_pending(&self) -> bool {
        self.outcome == OfferOutcome::Pending
    }
}
