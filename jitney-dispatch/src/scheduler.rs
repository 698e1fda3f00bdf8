use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use jitney_core::{
    ConflictReason, DispatchError, DriverDirectory, Offer, OfferOutcome, Ride, RideNotifier,
    RideStatus, RideStore, TransitionError,
};
use jitney_shared::{RideEvent, RideOfferEvent};

/// Fired when an offer's acceptance window elapses without a response.
#[derive(Debug, Clone, Copy)]
pub struct OfferTimeout {
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    pub offer_id: Uuid,
}

/// Result of resolving an offer outcome.
#[derive(Debug)]
pub enum Resolution {
    /// The transition was applied by this call.
    Applied(Ride),
    /// Duplicate resolution (network retry, double notification); the state
    /// was already what this call would have produced.
    Replayed(Ride),
}

impl Resolution {
    pub fn ride(&self) -> &Ride {
        match self {
            Resolution::Applied(r) | Resolution::Replayed(r) => r,
        }
    }
}

struct ArmedTimer {
    offer_id: Uuid,
    handle: JoinHandle<()>,
}

/// Owns the per-ride offer lifecycle: issuing the next offer, arming its
/// timeout, and resolving outcomes against the store's compare-and-swap.
///
/// Timer aborts are best-effort bookkeeping only; correctness never depends
/// on them. A timer that fires for an already-resolved offer loses the
/// conditional update and lands as a no-op.
pub struct OfferScheduler {
    store: Arc<dyn RideStore>,
    directory: Arc<dyn DriverDirectory>,
    notifier: Arc<dyn RideNotifier>,
    offer_window: chrono::Duration,
    timers: Mutex<HashMap<Uuid, ArmedTimer>>,
    timeout_tx: mpsc::Sender<OfferTimeout>,
}

impl OfferScheduler {
    pub fn new(
        store: Arc<dyn RideStore>,
        directory: Arc<dyn DriverDirectory>,
        notifier: Arc<dyn RideNotifier>,
        offer_window: chrono::Duration,
        timeout_tx: mpsc::Sender<OfferTimeout>,
    ) -> Self {
        Self {
            store,
            directory,
            notifier,
            offer_window,
            timers: Mutex::new(HashMap::new()),
            timeout_tx,
        }
    }

    /// Issue an offer to the head of the ride's candidate queue.
    ///
    /// Returns `Ok(None)` when the queue is empty (the coordinator then moves
    /// the ride to unmatched). A lost compare-and-swap means another actor
    /// advanced the ride concurrently (cancellation, usually) and surfaces as
    /// a `Superseded` conflict.
    pub async fn make_next_offer(&self, ride: &Ride) -> Result<Option<Offer>, DispatchError> {
        let Some(next) = ride.candidate_queue.first().copied() else {
            return Ok(None);
        };

        let expires_at = Utc::now() + self.offer_window;
        let mut updated = ride.clone();
        updated.candidate_queue.remove(0);
        updated
            .begin_offer(next.driver_id, expires_at)
            .map_err(|_| DispatchError::conflict(ride.id, ConflictReason::Superseded))?;

        let committed = self
            .store
            .conditionally_update_ride(ride.status, ride.offered_driver, &updated)
            .await?;
        if !committed {
            return Err(DispatchError::conflict(ride.id, ConflictReason::Superseded));
        }

        let offer = Offer::new(ride.id, next.driver_id, next.pickup_distance_km, expires_at);
        if let Err(e) = self.store.record_offer(&offer).await {
            // The swap committed but the offer row did not: without it the
            // driver is never notified and no timer will ever release the
            // ride. Put the ride back to searching, queue intact, so a
            // retried dispatch re-issues from a clean slate.
            match self
                .store
                .conditionally_update_ride(updated.status, updated.offered_driver, ride)
                .await
            {
                Ok(true) => {
                    info!(ride_id = %ride.id, driver_id = %next.driver_id, "offer write failed, ride released back to searching");
                }
                Ok(false) => {
                    warn!(ride_id = %ride.id, "offer write failed and release lost the swap");
                }
                Err(re) => {
                    warn!(ride_id = %ride.id, "offer write failed and release errored: {re}");
                }
            }
            return Err(e.into());
        }

        self.notifier
            .notify(RideEvent::Offer(RideOfferEvent {
                ride_id: ride.id,
                offer_id: offer.id,
                driver_id: offer.driver_id,
                pickup_lat: ride.pickup.lat,
                pickup_lng: ride.pickup.lng,
                dropoff_lat: ride.dropoff.lat,
                dropoff_lng: ride.dropoff.lng,
                pickup_distance_km: offer.pickup_distance_km,
                trip_distance_km: ride.estimated_distance_km,
                estimated_fare: ride.fare.fare,
                payment_method: ride.payment_method.as_str().to_string(),
                expires_at: expires_at.timestamp(),
                offered_at: offer.created_at.timestamp(),
            }))
            .await;

        self.arm_timer(&offer).await;

        info!(
            ride_id = %ride.id,
            driver_id = %offer.driver_id,
            expires_at = %expires_at,
            "offer issued"
        );
        Ok(Some(offer))
    }

    /// Resolve the current offer of `ride_id` for `driver_id`.
    ///
    /// Acceptance is a single atomic check-and-set against the ride's status
    /// and offered driver: of two racing accepts exactly one commits and the
    /// other gets a definitive conflict. Rejection and timeout release the
    /// ride back to searching. Duplicate resolutions come back as
    /// [`Resolution::Replayed`].
    pub async fn resolve(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        outcome: OfferOutcome,
    ) -> Result<Resolution, DispatchError> {
        match outcome {
            OfferOutcome::Accepted => self.resolve_accept(ride_id, driver_id).await,
            OfferOutcome::Rejected => self.resolve_release(ride_id, driver_id, outcome, true).await,
            OfferOutcome::TimedOut => {
                self.resolve_release(ride_id, driver_id, outcome, false).await
            }
            OfferOutcome::Pending | OfferOutcome::Withdrawn => Err(DispatchError::InvalidInput(
                format!("{} is not a resolvable outcome", outcome.as_str()),
            )),
        }
    }

    async fn resolve_accept(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
    ) -> Result<Resolution, DispatchError> {
        loop {
            let ride = self.store.get_ride(ride_id).await?;
            let now = Utc::now();

            // `assigned_driver` is only ever set by a committed accept, so a
            // matching driver means this accept already applied, however far
            // the trip has progressed since.
            if ride.assigned_driver == Some(driver_id) {
                return Ok(Resolution::Replayed(ride));
            }

            let mut updated = ride.clone();
            if let Err(e) = updated.accept(driver_id, now) {
                return Err(DispatchError::conflict(
                    ride_id,
                    accept_conflict_reason(&ride, e),
                ));
            }

            let committed = self
                .store
                .conditionally_update_ride(ride.status, ride.offered_driver, &updated)
                .await?;
            if committed {
                self.settle_offer(ride_id, driver_id, OfferOutcome::Accepted)
                    .await?;
                return Ok(Resolution::Applied(updated));
            }
            // Lost the swap: another resolver got there first. Re-read and
            // reclassify; statuses only advance, so this terminates.
            debug!(ride_id = %ride_id, driver_id = %driver_id, "accept lost the swap, re-reading");
        }
    }

    async fn resolve_release(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        outcome: OfferOutcome,
        is_rejection: bool,
    ) -> Result<Resolution, DispatchError> {
        loop {
            let ride = self.store.get_ride(ride_id).await?;

            if ride.offered_driver != Some(driver_id) {
                // Replay detection: this driver's offer may already carry a
                // terminal outcome from the first delivery of this signal.
                if let Some(offer) = self
                    .store
                    .latest_offer_for_driver(ride_id, driver_id)
                    .await?
                {
                    if offer.outcome.is_resolved() {
                        return Ok(Resolution::Replayed(ride));
                    }
                }
                return Err(DispatchError::conflict(
                    ride_id,
                    ConflictReason::NotOfferedToDriver,
                ));
            }

            let mut updated = ride.clone();
            updated
                .release_offer(driver_id)
                .map_err(|_| DispatchError::conflict(ride_id, ConflictReason::Superseded))?;

            let committed = self
                .store
                .conditionally_update_ride(ride.status, ride.offered_driver, &updated)
                .await?;
            if committed {
                self.settle_offer(ride_id, driver_id, outcome).await?;
                if is_rejection {
                    // Fire-and-forget: the profile owns the penalty policy
                    // and its unavailability never blocks the dispatch loop.
                    if let Err(e) = self.directory.record_rejection(driver_id).await {
                        warn!(driver_id = %driver_id, "failed to report rejection: {e}");
                    }
                }
                return Ok(Resolution::Applied(updated));
            }
            debug!(ride_id = %ride_id, driver_id = %driver_id, "release lost the swap, re-reading");
        }
    }

    /// Withdraw a still-pending offer after its ride was cancelled.
    /// Best-effort bookkeeping: the cancellation already committed.
    pub async fn withdraw_pending(&self, ride_id: Uuid, driver_id: Uuid) {
        match self.settle_offer(ride_id, driver_id, OfferOutcome::Withdrawn).await {
            Ok(()) => {}
            Err(e) => warn!(ride_id = %ride_id, "failed to withdraw pending offer: {e}"),
        }
    }

    /// Record the outcome on the offer row and disarm its timer.
    async fn settle_offer(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        outcome: OfferOutcome,
    ) -> Result<(), DispatchError> {
        if let Some(offer) = self
            .store
            .latest_offer_for_driver(ride_id, driver_id)
            .await?
        {
            self.store
                .resolve_offer(offer.id, outcome, Utc::now())
                .await?;
            self.abort_timer(ride_id, offer.id).await;
        }
        Ok(())
    }

    /// Arm the timeout for a freshly issued offer. The timer is keyed by the
    /// offer id so a stale handle from a superseded offer can never disarm or
    /// expire a newer one.
    async fn arm_timer(&self, offer: &Offer) {
        let window = (offer.expires_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let fired = OfferTimeout {
            ride_id: offer.ride_id,
            driver_id: offer.driver_id,
            offer_id: offer.id,
        };
        let tx = self.timeout_tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Receiver gone means the coordinator shut down; nothing to do.
            let _ = tx.send(fired).await;
        });

        let mut timers = self.timers.lock().await;
        if let Some(previous) = timers.insert(
            offer.ride_id,
            ArmedTimer {
                offer_id: offer.id,
                handle,
            },
        ) {
            // A ride has at most one live offer; any previous timer belongs
            // to an already-resolved offer.
            previous.handle.abort();
        }
    }

    async fn abort_timer(&self, ride_id: Uuid, offer_id: Uuid) {
        let mut timers = self.timers.lock().await;
        if timers.get(&ride_id).is_some_and(|t| t.offer_id == offer_id) {
            if let Some(timer) = timers.remove(&ride_id) {
                timer.handle.abort();
            }
        }
    }
}

fn accept_conflict_reason(ride: &Ride, err: TransitionError) -> ConflictReason {
    match err {
        TransitionError::OfferExpired => ConflictReason::OfferExpired,
        TransitionError::NotOfferedToDriver => ConflictReason::NotOfferedToDriver,
        TransitionError::InvalidTransition { .. } | TransitionError::NotAssignedDriver => {
            match ride.status {
                RideStatus::Accepted | RideStatus::Arrived | RideStatus::Started => {
                    ConflictReason::AlreadyAssigned
                }
                s if s.is_terminal() => ConflictReason::AlreadyTerminal,
                _ => ConflictReason::NotOfferedToDriver,
            }
        }
    }
}
