use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use jitney_core::geo::haversine_km;
use jitney_core::{
    ConflictReason, DispatchError, DriverDirectory, GeoPoint, Offer, OfferOutcome, PaymentMethod,
    QueuedCandidate, Ride, RideNotifier, RideStatus, RideStore, TransitionError,
};
use jitney_pricing::{estimate, PolicySource};
use jitney_shared::{RideCancelledEvent, RideEvent, RideUpdateEvent};
use jitney_store::app_config::{Config, DispatchConfig, RankingConfig};

use crate::ranking;
use crate::scheduler::{OfferScheduler, OfferTimeout, Resolution};

/// A trip request as handed in by the passenger-facing surface.
#[derive(Debug, Clone)]
pub struct NewRideRequest {
    pub passenger_id: Uuid,
    /// Phone number the passenger chose to share with the driver channel.
    pub passenger_contact: Option<String>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub payment_method: PaymentMethod,
}

/// Who asked for the cancellation. Authorization is the surface layer's
/// concern; the engine records the party for the event payload only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelParty {
    Passenger,
    Driver,
    Admin,
}

impl CancelParty {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelParty::Passenger => "passenger",
            CancelParty::Driver => "driver",
            CancelParty::Admin => "admin",
        }
    }
}

/// What a dispatch step left behind.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// An offer is out with a driver and its timeout is armed.
    Offered(Offer),
    /// The candidate queue ran dry; the ride is terminally unmatched.
    Unmatched,
    /// Another actor advanced the ride concurrently (typically a
    /// cancellation); the dispatch loop stopped without further action.
    Superseded,
}

/// Per-ride orchestration: creation, candidate ranking, the offer loop, the
/// driver's trip progression, and cancellation. Rides are independent units
/// of concurrency; nothing here serializes one ride behind another.
pub struct DispatchCoordinator {
    store: Arc<dyn RideStore>,
    directory: Arc<dyn DriverDirectory>,
    notifier: Arc<dyn RideNotifier>,
    policy_source: Arc<dyn PolicySource>,
    scheduler: OfferScheduler,
    dispatch_cfg: DispatchConfig,
    ranking_cfg: RankingConfig,
}

impl DispatchCoordinator {
    /// Build the coordinator and spawn its timeout listener. Must be called
    /// from within a tokio runtime. The listener holds only a weak handle,
    /// so dropping the last `Arc` shuts the loop down.
    pub fn new(
        store: Arc<dyn RideStore>,
        directory: Arc<dyn DriverDirectory>,
        notifier: Arc<dyn RideNotifier>,
        policy_source: Arc<dyn PolicySource>,
        config: &Config,
    ) -> Arc<Self> {
        let (timeout_tx, mut timeout_rx) = mpsc::channel::<OfferTimeout>(64);

        let scheduler = OfferScheduler::new(
            Arc::clone(&store),
            Arc::clone(&directory),
            Arc::clone(&notifier),
            Duration::seconds(config.dispatch.offer_window_secs as i64),
            timeout_tx,
        );

        let coordinator = Arc::new(Self {
            store,
            directory,
            notifier,
            policy_source,
            scheduler,
            dispatch_cfg: config.dispatch.clone(),
            ranking_cfg: config.ranking.clone(),
        });

        let weak = Arc::downgrade(&coordinator);
        tokio::spawn(async move {
            while let Some(fired) = timeout_rx.recv().await {
                let Some(this) = weak.upgrade() else { break };
                // Handled on its own task so one slow ride cannot delay
                // another ride's timeout.
                tokio::spawn(async move {
                    if let Err(e) = this.handle_timeout(fired).await {
                        warn!(ride_id = %fired.ride_id, "timeout handling failed: {e}");
                    }
                });
            }
        });

        coordinator
    }

    /// Validate, price, and persist a new ride in `Searching`.
    /// Input errors reject synchronously before any state mutation.
    pub async fn create_ride(&self, request: NewRideRequest) -> Result<Ride, DispatchError> {
        request
            .pickup
            .validate()
            .map_err(|e| DispatchError::InvalidInput(format!("pickup: {e}")))?;
        request
            .dropoff
            .validate()
            .map_err(|e| DispatchError::InvalidInput(format!("dropoff: {e}")))?;

        let distance_km = haversine_km(request.pickup, request.dropoff);
        let policy = self.policy_source.get_policy().await?;
        let quote = estimate(distance_km, &policy);

        let ride = Ride::new(
            request.passenger_id,
            request.passenger_contact,
            request.pickup,
            request.dropoff,
            request.payment_method,
            distance_km,
            quote,
            policy,
        );
        self.store.create_ride(&ride).await?;
        self.emit_update(&ride, false).await;

        info!(
            ride_id = %ride.id,
            distance_km,
            fare = quote.fare,
            "ride created"
        );
        Ok(ride)
    }

    /// Rank the current driver pool for a searching ride and issue the first
    /// offer. An empty candidate set is the normal `Unmatched` terminal
    /// outcome, not an error.
    pub async fn dispatch(&self, ride_id: Uuid) -> Result<DispatchOutcome, DispatchError> {
        let ride = self.store.get_ride(ride_id).await?;
        if ride.status != RideStatus::Searching {
            return Err(DispatchError::conflict(ride_id, ConflictReason::Superseded));
        }

        let now = Utc::now();
        let max_age = Duration::seconds(self.dispatch_cfg.location_max_age_secs as i64);
        let pool = self.directory.list_eligible_drivers().await?;
        let eligible: Vec<_> = pool
            .into_iter()
            .filter(|d| d.is_eligible(self.dispatch_cfg.min_balance, max_age, now))
            .collect();

        let ranked = ranking::rank(
            ride.pickup,
            &eligible,
            self.dispatch_cfg.max_candidates,
            &self.ranking_cfg,
        );
        debug!(ride_id = %ride_id, candidates = ranked.len(), "candidate pool ranked");

        if ranked.is_empty() {
            return self.mark_unmatched(ride).await;
        }

        let mut updated = ride.clone();
        updated.candidate_queue = ranked
            .iter()
            .map(|r| QueuedCandidate {
                driver_id: r.driver_id,
                pickup_distance_km: r.pickup_distance_km,
            })
            .collect();

        let committed = self
            .store
            .conditionally_update_ride(ride.status, ride.offered_driver, &updated)
            .await?;
        if !committed {
            return Ok(DispatchOutcome::Superseded);
        }

        self.offer_next(updated).await
    }

    /// A driver takes the offer. Exactly one accept per ride can ever
    /// succeed; losers get a definitive conflict. Replays of the winning
    /// accept are no-op successes.
    pub async fn accept_offer(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
    ) -> Result<Ride, DispatchError> {
        match self
            .scheduler
            .resolve(ride_id, driver_id, OfferOutcome::Accepted)
            .await?
        {
            Resolution::Applied(ride) => {
                info!(ride_id = %ride_id, driver_id = %driver_id, "ride accepted");
                self.emit_update(&ride, true).await;
                Ok(ride)
            }
            Resolution::Replayed(ride) => Ok(ride),
        }
    }

    /// A driver declines the offer; the ride moves on to the next candidate.
    pub async fn reject_offer(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
    ) -> Result<DispatchOutcome, DispatchError> {
        match self
            .scheduler
            .resolve(ride_id, driver_id, OfferOutcome::Rejected)
            .await?
        {
            Resolution::Applied(ride) => {
                info!(ride_id = %ride_id, driver_id = %driver_id, "offer rejected");
                self.emit_update(&ride, false).await;
                self.offer_next(ride).await
            }
            Resolution::Replayed(_) => Ok(DispatchOutcome::Superseded),
        }
    }

    /// Cancel a ride on behalf of `by`.
    ///
    /// Safe to race against acceptance: whichever conditional update commits
    /// first wins, and the loser gets a conflict rather than a silent no-op.
    /// A cancellation that started before acceptance never "un-assigns" a
    /// driver who won in the meantime.
    pub async fn cancel(&self, ride_id: Uuid, by: CancelParty) -> Result<Ride, DispatchError> {
        let mut first_observed: Option<RideStatus> = None;

        loop {
            let ride = self.store.get_ride(ride_id).await?;
            let observed = ride.status;
            let first = *first_observed.get_or_insert(observed);

            if !observed.is_cancellable() {
                let reason = if observed == RideStatus::Started {
                    ConflictReason::NotCancellable
                } else {
                    ConflictReason::AlreadyTerminal
                };
                return Err(DispatchError::conflict(ride_id, reason));
            }

            // An acceptance that committed while this cancel was in flight
            // wins the race; report the loss instead of cancelling the
            // now-assigned ride out from under the driver.
            if matches!(first, RideStatus::Searching | RideStatus::Offered)
                && matches!(observed, RideStatus::Accepted | RideStatus::Arrived)
            {
                return Err(DispatchError::conflict(
                    ride_id,
                    ConflictReason::AlreadyAssigned,
                ));
            }

            let offered = ride.offered_driver;
            let assigned = ride.assigned_driver;
            let mut updated = ride.clone();
            updated
                .cancel(Utc::now())
                .map_err(|_| DispatchError::conflict(ride_id, ConflictReason::NotCancellable))?;

            let committed = self
                .store
                .conditionally_update_ride(observed, offered, &updated)
                .await?;
            if committed {
                if let Some(driver_id) = offered {
                    self.scheduler.withdraw_pending(ride_id, driver_id).await;
                }
                self.notifier
                    .notify(RideEvent::Cancelled(RideCancelledEvent {
                        ride_id,
                        cancelled_by: by.as_str().to_string(),
                        driver_id: assigned.or(offered),
                        timestamp: Utc::now().timestamp(),
                    }))
                    .await;
                info!(ride_id = %ride_id, by = by.as_str(), "ride cancelled");
                return Ok(updated);
            }
            // State advanced concurrently; re-read and re-evaluate.
        }
    }

    /// Driver reports arrival at the pickup point. Optional stage; drivers
    /// may go straight to start.
    pub async fn mark_arrived(&self, ride_id: Uuid, driver_id: Uuid) -> Result<Ride, DispatchError> {
        let ride = self.store.get_ride(ride_id).await?;
        if ride.status == RideStatus::Arrived && ride.assigned_driver == Some(driver_id) {
            return Ok(ride);
        }

        let mut updated = ride.clone();
        updated
            .arrive(driver_id, Utc::now())
            .map_err(|e| DispatchError::conflict(ride_id, progress_conflict(&ride, e)))?;
        self.commit_progress(&ride, updated).await
    }

    /// Driver starts the trip.
    pub async fn mark_started(&self, ride_id: Uuid, driver_id: Uuid) -> Result<Ride, DispatchError> {
        let ride = self.store.get_ride(ride_id).await?;
        if ride.status == RideStatus::Started && ride.assigned_driver == Some(driver_id) {
            return Ok(ride);
        }

        let mut updated = ride.clone();
        updated
            .start(driver_id, Utc::now())
            .map_err(|e| DispatchError::conflict(ride_id, progress_conflict(&ride, e)))?;
        self.commit_progress(&ride, updated).await
    }

    /// Driver completes the trip. The fare is recomputed over the reported
    /// final distance with the ride's snapshot policy; a missing report
    /// falls back to the pickup-to-dropoff estimate.
    pub async fn mark_completed(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        final_distance_km: Option<f64>,
    ) -> Result<Ride, DispatchError> {
        let ride = self.store.get_ride(ride_id).await?;
        if ride.status == RideStatus::Completed && ride.assigned_driver == Some(driver_id) {
            return Ok(ride);
        }

        let distance = final_distance_km.unwrap_or(ride.estimated_distance_km);
        let quote = estimate(distance, &ride.policy);

        let mut updated = ride.clone();
        updated
            .complete(driver_id, distance, quote, Utc::now())
            .map_err(|e| DispatchError::conflict(ride_id, progress_conflict(&ride, e)))?;

        let completed = self.commit_progress(&ride, updated).await?;
        info!(
            ride_id = %ride_id,
            fare = quote.fare,
            commission = quote.commission,
            "ride completed"
        );
        Ok(completed)
    }

    async fn commit_progress(&self, current: &Ride, updated: Ride) -> Result<Ride, DispatchError> {
        let committed = self
            .store
            .conditionally_update_ride(current.status, current.offered_driver, &updated)
            .await?;
        if !committed {
            return Err(DispatchError::conflict(
                current.id,
                ConflictReason::Superseded,
            ));
        }
        self.emit_update(&updated, false).await;
        Ok(updated)
    }

    /// Internal timeout path: the offer's acceptance window elapsed.
    async fn handle_timeout(&self, fired: OfferTimeout) -> Result<(), DispatchError> {
        // A timer for a superseded offer must be a safe no-op; the offer row
        // is the cheap staleness check before touching the ride.
        let Some(offer) = self.store.get_offer(fired.offer_id).await? else {
            return Ok(());
        };
        if offer.outcome.is_resolved() {
            debug!(offer_id = %fired.offer_id, "stale timer fired for resolved offer");
            return Ok(());
        }

        match self
            .scheduler
            .resolve(fired.ride_id, fired.driver_id, OfferOutcome::TimedOut)
            .await
        {
            Ok(Resolution::Applied(ride)) => {
                info!(ride_id = %fired.ride_id, driver_id = %fired.driver_id, "offer timed out");
                self.emit_update(&ride, false).await;
                self.offer_next(ride).await?;
                Ok(())
            }
            Ok(Resolution::Replayed(_)) => Ok(()),
            // The offer resolved between the staleness check and the swap;
            // the winner already drove the ride forward.
            Err(DispatchError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Issue the next offer from the queue, or close the ride out as
    /// unmatched when the queue is empty.
    async fn offer_next(&self, ride: Ride) -> Result<DispatchOutcome, DispatchError> {
        match self.scheduler.make_next_offer(&ride).await {
            Ok(Some(offer)) => Ok(DispatchOutcome::Offered(offer)),
            Ok(None) => self.mark_unmatched(ride).await,
            Err(DispatchError::Conflict {
                reason: ConflictReason::Superseded,
                ..
            }) => Ok(DispatchOutcome::Superseded),
            Err(e) => Err(e),
        }
    }

    async fn mark_unmatched(&self, ride: Ride) -> Result<DispatchOutcome, DispatchError> {
        let mut updated = ride.clone();
        if updated.exhaust().is_err() {
            return Ok(DispatchOutcome::Superseded);
        }

        let committed = self
            .store
            .conditionally_update_ride(ride.status, ride.offered_driver, &updated)
            .await?;
        if !committed {
            return Ok(DispatchOutcome::Superseded);
        }

        info!(ride_id = %ride.id, "no candidates remain, ride unmatched");
        self.emit_update(&updated, false).await;
        Ok(DispatchOutcome::Unmatched)
    }

    /// Emit a `ride:update` fact. The passenger contact rides along only on
    /// acceptance, so the driver channel can render a call action; the final
    /// fare rides along only on completion.
    async fn emit_update(&self, ride: &Ride, include_contact: bool) {
        let fare = match ride.status {
            RideStatus::Completed => ride.final_fare,
            _ => None,
        };
        self.notifier
            .notify(RideEvent::Update(RideUpdateEvent {
                ride_id: ride.id,
                status: ride.status.as_str().to_string(),
                driver_id: ride.assigned_driver,
                fare: fare.map(|f| f.fare),
                commission: fare.map(|f| f.commission),
                passenger_contact: if include_contact {
                    ride.passenger_contact.clone()
                } else {
                    None
                },
                timestamp: Utc::now().timestamp(),
            }))
            .await;
    }
}

fn progress_conflict(ride: &Ride, err: TransitionError) -> ConflictReason {
    match err {
        TransitionError::NotAssignedDriver => ConflictReason::NotAssignedDriver,
        _ if ride.status.is_terminal() => ConflictReason::AlreadyTerminal,
        _ => ConflictReason::Superseded,
    }
}
