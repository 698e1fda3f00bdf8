use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use jitney_core::{
    DirectoryError, DriverCandidate, DriverDirectory, Offer, OfferOutcome, Ride, RideStatus,
    RideStore, StoreError,
};

/// In-memory ride and offer store for tests and single-process embedding.
///
/// The write lock makes `conditionally_update_ride` a true compare-and-swap:
/// check and replacement happen under one exclusive guard, so concurrent
/// accept attempts serialize and exactly one observes its expectations.
#[derive(Default)]
pub struct MemoryRideStore {
    rides: RwLock<HashMap<Uuid, Ride>>,
    offers: RwLock<HashMap<Uuid, Offer>>,
}

impl MemoryRideStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RideStore for MemoryRideStore {
    async fn create_ride(&self, ride: &Ride) -> Result<(), StoreError> {
        let mut rides = self.rides.write().await;
        rides.insert(ride.id, ride.clone());
        Ok(())
    }

    async fn get_ride(&self, ride_id: Uuid) -> Result<Ride, StoreError> {
        let rides = self.rides.read().await;
        rides
            .get(&ride_id)
            .cloned()
            .ok_or(StoreError::RideNotFound(ride_id))
    }

    async fn conditionally_update_ride(
        &self,
        expected_status: RideStatus,
        expected_offered_driver: Option<Uuid>,
        updated: &Ride,
    ) -> Result<bool, StoreError> {
        let mut rides = self.rides.write().await;
        let current = rides
            .get(&updated.id)
            .ok_or(StoreError::RideNotFound(updated.id))?;

        if current.status != expected_status || current.offered_driver != expected_offered_driver {
            debug!(
                ride_id = %updated.id,
                expected = expected_status.as_str(),
                actual = current.status.as_str(),
                "conditional ride update lost the race"
            );
            return Ok(false);
        }

        rides.insert(updated.id, updated.clone());
        Ok(true)
    }

    async fn list_rides_by_status(&self, status: RideStatus) -> Result<Vec<Ride>, StoreError> {
        let rides = self.rides.read().await;
        Ok(rides
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn record_offer(&self, offer: &Offer) -> Result<(), StoreError> {
        let mut offers = self.offers.write().await;
        offers.insert(offer.id, offer.clone());
        Ok(())
    }

    async fn get_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, StoreError> {
        let offers = self.offers.read().await;
        Ok(offers.get(&offer_id).cloned())
    }

    async fn latest_offer_for_driver(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
    ) -> Result<Option<Offer>, StoreError> {
        let offers = self.offers.read().await;
        Ok(offers
            .values()
            .filter(|o| o.ride_id == ride_id && o.driver_id == driver_id)
            .max_by_key(|o| o.created_at)
            .cloned())
    }

    async fn resolve_offer(
        &self,
        offer_id: Uuid,
        outcome: OfferOutcome,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut offers = self.offers.write().await;
        let offer = offers
            .get_mut(&offer_id)
            .ok_or(StoreError::OfferNotFound(offer_id))?;

        if offer.outcome.is_resolved() {
            return Ok(false);
        }

        offer.outcome = outcome;
        offer.resolved_at = Some(resolved_at);
        Ok(true)
    }
}

/// In-memory driver directory. Stands in for the driver-profile collaborator
/// in tests and single-process deployments; the rejection penalty lives here,
/// not in the engine.
#[derive(Default)]
pub struct MemoryDriverDirectory {
    drivers: RwLock<HashMap<Uuid, DriverCandidate>>,
}

impl MemoryDriverDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, candidate: DriverCandidate) {
        let mut drivers = self.drivers.write().await;
        drivers.insert(candidate.id, candidate);
    }

    pub async fn set_online(&self, driver_id: Uuid, online: bool) {
        let mut drivers = self.drivers.write().await;
        if let Some(driver) = drivers.get_mut(&driver_id) {
            driver.online = online;
        }
    }

    pub async fn get(&self, driver_id: Uuid) -> Option<DriverCandidate> {
        let drivers = self.drivers.read().await;
        drivers.get(&driver_id).cloned()
    }
}

#[async_trait]
impl DriverDirectory for MemoryDriverDirectory {
    async fn list_eligible_drivers(&self) -> Result<Vec<DriverCandidate>, DirectoryError> {
        let drivers = self.drivers.read().await;
        Ok(drivers
            .values()
            .filter(|d| d.online && d.approved)
            .cloned()
            .collect())
    }

    async fn record_rejection(&self, driver_id: Uuid) -> Result<(), DirectoryError> {
        let mut drivers = self.drivers.write().await;
        if let Some(driver) = drivers.get_mut(&driver_id) {
            driver.rejection_count += 1;
            driver.rating = (driver.rating - 0.03).max(1.0);
        }
        Ok(())
    }
}
