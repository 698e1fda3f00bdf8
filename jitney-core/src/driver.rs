use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

/// Snapshot of a driver taken from the driver directory at dispatch time.
/// Ephemeral: the profile itself (rating, balance, penalties) is owned by the
/// driver-profile collaborator, and the snapshot is only guaranteed "recent".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverCandidate {
    pub id: Uuid,
    pub location: GeoPoint,
    pub approved: bool,
    pub online: bool,
    pub balance: f64,
    pub rating: f64,
    pub rejection_count: u32,
    /// When the location fix was reported; stale fixes are not dispatchable.
    pub located_at: DateTime<Utc>,
}

impl DriverCandidate {
    /// Defensive re-check of directory eligibility: approved, online, balance
    /// above the floor, and a location fix fresher than `max_location_age`.
    pub fn is_eligible(
        &self,
        min_balance: f64,
        max_location_age: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        self.approved
            && self.online
            && self.balance >= min_balance
            && now - self.located_at <= max_location_age
    }
}
