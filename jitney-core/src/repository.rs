use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jitney_shared::RideEvent;
use uuid::Uuid;

use crate::driver::DriverCandidate;
use crate::error::{DirectoryError, StoreError};
use crate::offer::{Offer, OfferOutcome};
use crate::ride::{Ride, RideStatus};

/// Persistence contract for rides and offers.
///
/// `conditionally_update_ride` is the engine's compare-and-swap: the write
/// commits only if the stored ride still carries the expected status and
/// offered driver. Every status transition goes through it, which is what
/// makes acceptance at-most-once under concurrent resolvers.
#[async_trait]
pub trait RideStore: Send + Sync {
    async fn create_ride(&self, ride: &Ride) -> Result<(), StoreError>;

    async fn get_ride(&self, ride_id: Uuid) -> Result<Ride, StoreError>;

    /// Replace the stored ride with `updated` iff the stored record still has
    /// `expected_status` and `expected_offered_driver`. Returns whether the
    /// swap committed. Must be atomic at the storage layer.
    async fn conditionally_update_ride(
        &self,
        expected_status: RideStatus,
        expected_offered_driver: Option<Uuid>,
        updated: &Ride,
    ) -> Result<bool, StoreError>;

    async fn list_rides_by_status(&self, status: RideStatus) -> Result<Vec<Ride>, StoreError>;

    async fn record_offer(&self, offer: &Offer) -> Result<(), StoreError>;

    async fn get_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, StoreError>;

    /// Most recent offer made to `driver_id` for `ride_id`, if any. Used for
    /// replay detection: a duplicate accept/reject looks up what already
    /// happened to its offer.
    async fn latest_offer_for_driver(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
    ) -> Result<Option<Offer>, StoreError>;

    /// Record a terminal outcome for a pending offer. Returns `false` when
    /// the offer was already resolved (duplicate resolution is a no-op, not
    /// an error).
    async fn resolve_offer(
        &self,
        offer_id: Uuid,
        outcome: OfferOutcome,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Read-only view of the driver pool, owned by the driver-profile
/// collaborator. The snapshot carries no consistency guarantee beyond
/// "recent".
#[async_trait]
pub trait DriverDirectory: Send + Sync {
    async fn list_eligible_drivers(&self) -> Result<Vec<DriverCandidate>, DirectoryError>;

    /// Report an explicit rejection so the profile can apply its penalty
    /// policy. The penalty magnitude and timing are the collaborator's
    /// choice, not the engine's.
    async fn record_rejection(&self, driver_id: Uuid) -> Result<(), DirectoryError>;
}

/// Fire-and-forget notification sink. Implementations swallow delivery
/// failures; a committed state change is never rolled back because a
/// notification could not be sent.
#[async_trait]
pub trait RideNotifier: Send + Sync {
    async fn notify(&self, event: RideEvent);
}
