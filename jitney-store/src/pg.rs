use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use jitney_core::{
    GeoPoint, Offer, OfferOutcome, PaymentMethod, QueuedCandidate, Ride, RideStatus, RideStore,
    StoreError,
};
use jitney_pricing::{FareQuote, PricingPolicy};
use jitney_shared::Masked;

/// Postgres-backed ride store. The conditional update is a single `UPDATE ..
/// WHERE id AND status AND offered_driver IS NOT DISTINCT FROM ..` judged by
/// `rows_affected`, which makes the compare-and-swap atomic at the storage
/// layer without any advisory locking.
pub struct PgRideStore {
    pool: PgPool,
}

impl PgRideStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn map_ride(row: &PgRow) -> Result<Ride, StoreError> {
    let status: String = row.try_get("status").map_err(backend)?;
    let payment_method: String = row.try_get("payment_method").map_err(backend)?;
    let policy: serde_json::Value = row.try_get("policy").map_err(backend)?;
    let queue: serde_json::Value = row.try_get("candidate_queue").map_err(backend)?;
    let contact: Option<String> = row.try_get("passenger_contact").map_err(backend)?;

    let final_fare: Option<f64> = row.try_get("final_fare").map_err(backend)?;
    let final_commission: Option<f64> = row.try_get("final_commission").map_err(backend)?;

    Ok(Ride {
        id: row.try_get("id").map_err(backend)?,
        passenger_id: row.try_get("passenger_id").map_err(backend)?,
        passenger_contact: contact.map(Masked::new),
        pickup: GeoPoint::new(
            row.try_get("pickup_lat").map_err(backend)?,
            row.try_get("pickup_lng").map_err(backend)?,
        ),
        dropoff: GeoPoint::new(
            row.try_get("dropoff_lat").map_err(backend)?,
            row.try_get("dropoff_lng").map_err(backend)?,
        ),
        payment_method: PaymentMethod::from_str(&payment_method).map_err(StoreError::Backend)?,
        estimated_distance_km: row.try_get("estimated_distance_km").map_err(backend)?,
        fare: FareQuote {
            fare: row.try_get("fare").map_err(backend)?,
            commission: row.try_get("commission").map_err(backend)?,
        },
        policy: serde_json::from_value::<PricingPolicy>(policy).map_err(backend)?,
        status: RideStatus::from_str(&status).map_err(StoreError::Backend)?,
        offered_driver: row.try_get("offered_driver").map_err(backend)?,
        offer_expires_at: row.try_get("offer_expires_at").map_err(backend)?,
        assigned_driver: row.try_get("assigned_driver").map_err(backend)?,
        candidate_queue: serde_json::from_value::<Vec<QueuedCandidate>>(queue).map_err(backend)?,
        final_distance_km: row.try_get("final_distance_km").map_err(backend)?,
        final_fare: match (final_fare, final_commission) {
            (Some(fare), Some(commission)) => Some(FareQuote { fare, commission }),
            _ => None,
        },
        created_at: row.try_get("created_at").map_err(backend)?,
        accepted_at: row.try_get("accepted_at").map_err(backend)?,
        arrived_at: row.try_get("arrived_at").map_err(backend)?,
        started_at: row.try_get("started_at").map_err(backend)?,
        completed_at: row.try_get("completed_at").map_err(backend)?,
        cancelled_at: row.try_get("cancelled_at").map_err(backend)?,
    })
}

fn map_offer(row: &PgRow) -> Result<Offer, StoreError> {
    let outcome: String = row.try_get("outcome").map_err(backend)?;

    Ok(Offer {
        id: row.try_get("id").map_err(backend)?,
        ride_id: row.try_get("ride_id").map_err(backend)?,
        driver_id: row.try_get("driver_id").map_err(backend)?,
        pickup_distance_km: row.try_get("pickup_distance_km").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        expires_at: row.try_get("expires_at").map_err(backend)?,
        outcome: OfferOutcome::from_str(&outcome).map_err(StoreError::Backend)?,
        resolved_at: row.try_get("resolved_at").map_err(backend)?,
    })
}

#[async_trait]
impl RideStore for PgRideStore {
    async fn create_ride(&self, ride: &Ride) -> Result<(), StoreError> {
        let queue = serde_json::to_value(&ride.candidate_queue).map_err(backend)?;
        let policy = serde_json::to_value(&ride.policy).map_err(backend)?;

        sqlx::query(
            r#"
            INSERT INTO rides (
                id, passenger_id, passenger_contact,
                pickup_lat, pickup_lng, dropoff_lat, dropoff_lng,
                payment_method, estimated_distance_km, fare, commission,
                policy, status, offered_driver, offer_expires_at,
                assigned_driver, candidate_queue, created_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
            "#,
        )
        .bind(ride.id)
        .bind(ride.passenger_id)
        .bind(ride.passenger_contact.as_ref().map(|c| c.expose().clone()))
        .bind(ride.pickup.lat)
        .bind(ride.pickup.lng)
        .bind(ride.dropoff.lat)
        .bind(ride.dropoff.lng)
        .bind(ride.payment_method.as_str())
        .bind(ride.estimated_distance_km)
        .bind(ride.fare.fare)
        .bind(ride.fare.commission)
        .bind(policy)
        .bind(ride.status.as_str())
        .bind(ride.offered_driver)
        .bind(ride.offer_expires_at)
        .bind(ride.assigned_driver)
        .bind(queue)
        .bind(ride.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn get_ride(&self, ride_id: Uuid) -> Result<Ride, StoreError> {
        let row = sqlx::query("SELECT * FROM rides WHERE id = $1")
            .bind(ride_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StoreError::RideNotFound(ride_id))?;

        map_ride(&row)
    }

    async fn conditionally_update_ride(
        &self,
        expected_status: RideStatus,
        expected_offered_driver: Option<Uuid>,
        updated: &Ride,
    ) -> Result<bool, StoreError> {
        let queue = serde_json::to_value(&updated.candidate_queue).map_err(backend)?;

        let result = sqlx::query(
            r#"
            UPDATE rides SET
                status = $2,
                offered_driver = $3,
                offer_expires_at = $4,
                assigned_driver = $5,
                candidate_queue = $6,
                final_distance_km = $7,
                final_fare = $8,
                final_commission = $9,
                accepted_at = $10,
                arrived_at = $11,
                started_at = $12,
                completed_at = $13,
                cancelled_at = $14
            WHERE id = $1
              AND status = $15
              AND offered_driver IS NOT DISTINCT FROM $16
            "#,
        )
        .bind(updated.id)
        .bind(updated.status.as_str())
        .bind(updated.offered_driver)
        .bind(updated.offer_expires_at)
        .bind(updated.assigned_driver)
        .bind(queue)
        .bind(updated.final_distance_km)
        .bind(updated.final_fare.map(|f| f.fare))
        .bind(updated.final_fare.map(|f| f.commission))
        .bind(updated.accepted_at)
        .bind(updated.arrived_at)
        .bind(updated.started_at)
        .bind(updated.completed_at)
        .bind(updated.cancelled_at)
        .bind(expected_status.as_str())
        .bind(expected_offered_driver)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_rides_by_status(&self, status: RideStatus) -> Result<Vec<Ride>, StoreError> {
        let rows = sqlx::query("SELECT * FROM rides WHERE status = $1 ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.iter().map(map_ride).collect()
    }

    async fn record_offer(&self, offer: &Offer) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO offers (
                id, ride_id, driver_id, pickup_distance_km,
                created_at, expires_at, outcome, resolved_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            "#,
        )
        .bind(offer.id)
        .bind(offer.ride_id)
        .bind(offer.driver_id)
        .bind(offer.pickup_distance_km)
        .bind(offer.created_at)
        .bind(offer.expires_at)
        .bind(offer.outcome.as_str())
        .bind(offer.resolved_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn get_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, StoreError> {
        let row = sqlx::query("SELECT * FROM offers WHERE id = $1")
            .bind(offer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.as_ref().map(map_offer).transpose()
    }

    async fn latest_offer_for_driver(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
    ) -> Result<Option<Offer>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM offers
            WHERE ride_id = $1 AND driver_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(ride_id)
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(map_offer).transpose()
    }

    async fn resolve_offer(
        &self,
        offer_id: Uuid,
        outcome: OfferOutcome,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // Guarded on PENDING so a duplicate resolution cannot overwrite a
        // terminal outcome.
        let result = sqlx::query(
            r#"
            UPDATE offers SET outcome = $2, resolved_at = $3
            WHERE id = $1 AND outcome = 'PENDING'
            "#,
        )
        .bind(offer_id)
        .bind(outcome.as_str())
        .bind(resolved_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() == 1)
    }
}
