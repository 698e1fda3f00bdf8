use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use jitney_core::{
    DispatchError, DriverCandidate, GeoPoint, Offer, OfferOutcome, PaymentMethod, Ride,
    RideStatus, RideStore, StoreError,
};
use jitney_dispatch::{CancelParty, DispatchCoordinator, DispatchOutcome, NewRideRequest};
use jitney_pricing::{PricingPolicy, SharedPolicySource};
use jitney_store::app_config::Config;
use jitney_store::{BroadcastNotifier, MemoryDriverDirectory, MemoryRideStore};

const PICKUP: GeoPoint = GeoPoint {
    lat: 40.4093,
    lng: 49.8671,
};
const DROPOFF: GeoPoint = GeoPoint {
    lat: 40.4320,
    lng: 49.9000,
};

struct Harness {
    coordinator: Arc<DispatchCoordinator>,
    store: Arc<MemoryRideStore>,
    directory: Arc<MemoryDriverDirectory>,
    notifier: BroadcastNotifier,
    policy: Arc<SharedPolicySource>,
}

fn harness(offer_window_secs: u64) -> Harness {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });

    let store = Arc::new(MemoryRideStore::new());
    let directory = Arc::new(MemoryDriverDirectory::new());
    let notifier = BroadcastNotifier::new(64);
    let policy = Arc::new(SharedPolicySource::default());

    let mut config = Config::default();
    config.dispatch.offer_window_secs = offer_window_secs;

    let coordinator = DispatchCoordinator::new(
        store.clone(),
        directory.clone(),
        Arc::new(notifier.clone()),
        policy.clone(),
        &config,
    );

    Harness {
        coordinator,
        store,
        directory,
        notifier,
        policy,
    }
}

fn driver_near_pickup(offset_lat: f64, rating: f64) -> DriverCandidate {
    DriverCandidate {
        id: Uuid::new_v4(),
        location: GeoPoint::new(PICKUP.lat + offset_lat, PICKUP.lng),
        approved: true,
        online: true,
        balance: 10.0,
        rating,
        rejection_count: 0,
        located_at: Utc::now(),
    }
}

fn request() -> NewRideRequest {
    NewRideRequest {
        passenger_id: Uuid::new_v4(),
        passenger_contact: Some("+994501234567".to_string()),
        pickup: PICKUP,
        dropoff: DROPOFF,
        payment_method: PaymentMethod::Cash,
    }
}

/// Store that refuses the first `failures_left` offer writes and delegates
/// everything else, for exercising the issuance rollback path.
struct FlakyOfferStore {
    inner: Arc<MemoryRideStore>,
    failures_left: AtomicUsize,
}

#[async_trait]
impl RideStore for FlakyOfferStore {
    async fn create_ride(&self, ride: &Ride) -> Result<(), StoreError> {
        self.inner.create_ride(ride).await
    }

    async fn get_ride(&self, ride_id: Uuid) -> Result<Ride, StoreError> {
        self.inner.get_ride(ride_id).await
    }

    async fn conditionally_update_ride(
        &self,
        expected_status: RideStatus,
        expected_offered_driver: Option<Uuid>,
        updated: &Ride,
    ) -> Result<bool, StoreError> {
        self.inner
            .conditionally_update_ride(expected_status, expected_offered_driver, updated)
            .await
    }

    async fn list_rides_by_status(&self, status: RideStatus) -> Result<Vec<Ride>, StoreError> {
        self.inner.list_rides_by_status(status).await
    }

    async fn record_offer(&self, offer: &Offer) -> Result<(), StoreError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Backend("offer write refused".to_string()));
        }
        self.inner.record_offer(offer).await
    }

    async fn get_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, StoreError> {
        self.inner.get_offer(offer_id).await
    }

    async fn latest_offer_for_driver(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
    ) -> Result<Option<Offer>, StoreError> {
        self.inner.latest_offer_for_driver(ride_id, driver_id).await
    }

    async fn resolve_offer(
        &self,
        offer_id: Uuid,
        outcome: OfferOutcome,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.resolve_offer(offer_id, outcome, resolved_at).await
    }
}

/// Seed drivers in increasing distance order and return their ids, closest
/// (and therefore first-offered) first.
async fn seed_drivers(h: &Harness, count: usize) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for i in 0..count {
        let d = driver_near_pickup(0.005 * (i as f64 + 1.0), 4.5);
        ids.push(d.id);
        h.directory.upsert(d).await;
    }
    ids
}

#[tokio::test]
async fn concurrent_accepts_yield_exactly_one_winner() {
    let h = harness(20);
    let drivers = seed_drivers(&h, 1).await;
    let offered = drivers[0];

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    match h.coordinator.dispatch(ride.id).await.unwrap() {
        DispatchOutcome::Offered(offer) => assert_eq!(offer.driver_id, offered),
        other => panic!("expected an offer, got {other:?}"),
    }

    // The offered driver races four impostors for the same offer.
    let mut attempts = vec![offered];
    attempts.extend((0..4).map(|_| Uuid::new_v4()));

    let mut handles = Vec::new();
    for driver in attempts {
        let c = h.coordinator.clone();
        handles.push(tokio::spawn(
            async move { c.accept_offer(ride.id, driver).await },
        ));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(r) => {
                successes += 1;
                assert_eq!(r.assigned_driver, Some(offered));
            }
            Err(DispatchError::Conflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 4);

    let stored = h.store.get_ride(ride.id).await.unwrap();
    assert_eq!(stored.status, RideStatus::Accepted);
    assert_eq!(stored.assigned_driver, Some(offered));
}

#[tokio::test]
async fn duplicate_accept_is_idempotent() {
    let h = harness(20);
    let drivers = seed_drivers(&h, 1).await;

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    h.coordinator.dispatch(ride.id).await.unwrap();

    let first = h.coordinator.accept_offer(ride.id, drivers[0]).await.unwrap();
    let replay = h.coordinator.accept_offer(ride.id, drivers[0]).await.unwrap();

    assert_eq!(first.status, RideStatus::Accepted);
    assert_eq!(replay.status, RideStatus::Accepted);
    assert_eq!(replay.assigned_driver, Some(drivers[0]));
    assert_eq!(
        first.accepted_at, replay.accepted_at,
        "replay must not re-stamp the transition"
    );
}

#[tokio::test]
async fn accept_replay_after_trip_start_is_a_noop() {
    let h = harness(20);
    let drivers = seed_drivers(&h, 1).await;
    let driver = drivers[0];

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    h.coordinator.dispatch(ride.id).await.unwrap();
    h.coordinator.accept_offer(ride.id, driver).await.unwrap();
    h.coordinator.mark_started(ride.id, driver).await.unwrap();

    // A redelivered accept from the winning driver lands after the trip has
    // moved on; it reports success without rewinding anything.
    let replay = h.coordinator.accept_offer(ride.id, driver).await.unwrap();
    assert_eq!(replay.status, RideStatus::Started);
    assert_eq!(replay.assigned_driver, Some(driver));

    let stored = h.store.get_ride(ride.id).await.unwrap();
    assert_eq!(stored.status, RideStatus::Started);
}

#[tokio::test]
async fn failed_offer_write_releases_the_ride_for_retry() {
    let store = Arc::new(FlakyOfferStore {
        inner: Arc::new(MemoryRideStore::new()),
        failures_left: AtomicUsize::new(1),
    });
    let directory = Arc::new(MemoryDriverDirectory::new());
    let notifier = BroadcastNotifier::new(64);
    let policy = Arc::new(SharedPolicySource::default());
    let mut config = Config::default();
    config.dispatch.offer_window_secs = 1;

    let coordinator = DispatchCoordinator::new(
        store.clone(),
        directory.clone(),
        Arc::new(notifier),
        policy,
        &config,
    );

    let candidate = driver_near_pickup(0.005, 4.5);
    let driver = candidate.id;
    directory.upsert(candidate).await;

    let ride = coordinator.create_ride(request()).await.unwrap();
    let failed = coordinator.dispatch(ride.id).await;
    assert!(matches!(failed, Err(DispatchError::Store(_))));

    // The half-issued offer was unwound, not left wedged in offered.
    let stored = store.get_ride(ride.id).await.unwrap();
    assert_eq!(stored.status, RideStatus::Searching);
    assert_eq!(stored.offered_driver, None);

    // A retried dispatch issues normally and its timer is live: left
    // unanswered, the offer expires and the ride closes out.
    match coordinator.dispatch(ride.id).await.unwrap() {
        DispatchOutcome::Offered(offer) => assert_eq!(offer.driver_id, driver),
        other => panic!("expected an offer on retry, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(1600)).await;

    let stored = store.get_ride(ride.id).await.unwrap();
    assert_eq!(stored.status, RideStatus::Unmatched);
}

#[tokio::test]
async fn rejection_advances_to_next_candidate_and_penalizes() {
    let h = harness(20);
    let drivers = seed_drivers(&h, 2).await;

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    h.coordinator.dispatch(ride.id).await.unwrap();

    match h.coordinator.reject_offer(ride.id, drivers[0]).await.unwrap() {
        DispatchOutcome::Offered(offer) => assert_eq!(offer.driver_id, drivers[1]),
        other => panic!("expected the next offer, got {other:?}"),
    }

    let stored = h.store.get_ride(ride.id).await.unwrap();
    assert_eq!(stored.status, RideStatus::Offered);
    assert_eq!(stored.offered_driver, Some(drivers[1]));

    let first_offer = h
        .store
        .latest_offer_for_driver(ride.id, drivers[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first_offer.outcome, OfferOutcome::Rejected);

    // Explicit decline reaches the profile collaborator.
    let profile = h.directory.get(drivers[0]).await.unwrap();
    assert_eq!(profile.rejection_count, 1);
}

#[tokio::test]
async fn exhaustion_terminates_in_unmatched() {
    let h = harness(20);
    let drivers = seed_drivers(&h, 3).await;

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    h.coordinator.dispatch(ride.id).await.unwrap();

    let mut last = None;
    for driver in &drivers {
        last = Some(h.coordinator.reject_offer(ride.id, *driver).await.unwrap());
    }
    assert!(matches!(last, Some(DispatchOutcome::Unmatched)));

    let stored = h.store.get_ride(ride.id).await.unwrap();
    assert_eq!(stored.status, RideStatus::Unmatched);
    assert_eq!(stored.assigned_driver, None);
    assert!(stored.candidate_queue.is_empty());
}

#[tokio::test]
async fn duplicate_reject_is_a_noop() {
    let h = harness(20);
    let drivers = seed_drivers(&h, 2).await;

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    h.coordinator.dispatch(ride.id).await.unwrap();

    h.coordinator.reject_offer(ride.id, drivers[0]).await.unwrap();
    let replay = h.coordinator.reject_offer(ride.id, drivers[0]).await.unwrap();
    assert!(matches!(replay, DispatchOutcome::Superseded));

    // The duplicate did not disturb the successor offer.
    let stored = h.store.get_ride(ride.id).await.unwrap();
    assert_eq!(stored.offered_driver, Some(drivers[1]));
}

#[tokio::test]
async fn timeout_advances_and_stale_timer_is_harmless() {
    let h = harness(1);
    let drivers = seed_drivers(&h, 2).await;

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    h.coordinator.dispatch(ride.id).await.unwrap();

    // First offer times out unanswered.
    tokio::time::sleep(Duration::from_millis(1600)).await;

    let stored = h.store.get_ride(ride.id).await.unwrap();
    assert_eq!(stored.status, RideStatus::Offered);
    assert_eq!(stored.offered_driver, Some(drivers[1]));

    let first_offer = h
        .store
        .latest_offer_for_driver(ride.id, drivers[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first_offer.outcome, OfferOutcome::TimedOut);

    // Timeouts are not rejections; no penalty reaches the profile.
    assert_eq!(h.directory.get(drivers[0]).await.unwrap().rejection_count, 0);

    // Accept the live offer, then outlive its timer: the stale firing must
    // not disturb the accepted ride.
    h.coordinator.accept_offer(ride.id, drivers[1]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1400)).await;

    let settled = h.store.get_ride(ride.id).await.unwrap();
    assert_eq!(settled.status, RideStatus::Accepted);
    assert_eq!(settled.assigned_driver, Some(drivers[1]));
}

#[tokio::test]
async fn cancel_and_accept_race_has_one_winner() {
    let h = harness(20);
    let drivers = seed_drivers(&h, 1).await;
    let driver = drivers[0];

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    h.coordinator.dispatch(ride.id).await.unwrap();

    let c1 = h.coordinator.clone();
    let accept = tokio::spawn(async move { c1.accept_offer(ride.id, driver).await });
    let c2 = h.coordinator.clone();
    let cancel = tokio::spawn(async move { c2.cancel(ride.id, CancelParty::Passenger).await });

    let accept_result = accept.await.unwrap();
    let cancel_result = cancel.await.unwrap();

    let stored = h.store.get_ride(ride.id).await.unwrap();
    match (accept_result, cancel_result) {
        (Ok(_), Err(DispatchError::Conflict { .. })) => {
            assert_eq!(stored.status, RideStatus::Accepted);
            assert_eq!(stored.assigned_driver, Some(driver));
        }
        (Err(DispatchError::Conflict { .. }), Ok(_)) => {
            assert_eq!(stored.status, RideStatus::Cancelled);
            assert_eq!(stored.assigned_driver, None);
        }
        (a, c) => panic!("expected exactly one winner, got accept={a:?} cancel={c:?}"),
    }
}

#[tokio::test]
async fn cancel_withdraws_the_pending_offer() {
    let h = harness(20);
    let drivers = seed_drivers(&h, 1).await;

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    h.coordinator.dispatch(ride.id).await.unwrap();

    let cancelled = h
        .coordinator
        .cancel(ride.id, CancelParty::Passenger)
        .await
        .unwrap();
    assert_eq!(cancelled.status, RideStatus::Cancelled);

    let offer = h
        .store
        .latest_offer_for_driver(ride.id, drivers[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(offer.outcome, OfferOutcome::Withdrawn);

    // The withdrawn driver's accept is definitively refused.
    let late = h.coordinator.accept_offer(ride.id, drivers[0]).await;
    assert!(matches!(late, Err(DispatchError::Conflict { .. })));
}

#[tokio::test]
async fn no_candidates_means_unmatched_not_error() {
    let h = harness(20);

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    let outcome = h.coordinator.dispatch(ride.id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Unmatched));

    let stored = h.store.get_ride(ride.id).await.unwrap();
    assert_eq!(stored.status, RideStatus::Unmatched);
}

#[tokio::test]
async fn far_away_drivers_are_not_candidates() {
    let h = harness(20);
    // ~0.5 deg latitude is ~55 km, far outside the 6 km radius.
    h.directory.upsert(driver_near_pickup(0.5, 5.0)).await;

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    let outcome = h.coordinator.dispatch(ride.id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Unmatched));
}

#[tokio::test]
async fn completion_fare_uses_the_snapshot_policy() {
    let h = harness(20);
    let drivers = seed_drivers(&h, 1).await;
    let driver = drivers[0];

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    h.coordinator.dispatch(ride.id).await.unwrap();
    h.coordinator.accept_offer(ride.id, driver).await.unwrap();

    // The admin retunes the tariff mid-trip; this ride keeps its quote basis.
    h.policy
        .set(PricingPolicy {
            base_fare: 10.0,
            ..PricingPolicy::default()
        })
        .await;

    h.coordinator.mark_arrived(ride.id, driver).await.unwrap();
    h.coordinator.mark_started(ride.id, driver).await.unwrap();
    let done = h
        .coordinator
        .mark_completed(ride.id, driver, Some(5.0))
        .await
        .unwrap();

    assert_eq!(done.status, RideStatus::Completed);
    let final_fare = done.final_fare.unwrap();
    assert_eq!(final_fare.fare, 4.30); // 3.50 + 2 * 0.40, not 10-based
    assert_eq!(final_fare.commission, 0.43);
    assert_eq!(done.final_distance_km, Some(5.0));
}

#[tokio::test]
async fn trip_progression_is_driver_gated() {
    let h = harness(20);
    let drivers = seed_drivers(&h, 1).await;
    let driver = drivers[0];

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    h.coordinator.dispatch(ride.id).await.unwrap();
    h.coordinator.accept_offer(ride.id, driver).await.unwrap();

    let stranger = Uuid::new_v4();
    assert!(matches!(
        h.coordinator.mark_started(ride.id, stranger).await,
        Err(DispatchError::Conflict { .. })
    ));

    // The arrival tap is optional.
    h.coordinator.mark_started(ride.id, driver).await.unwrap();

    // Cancellation is refused once the trip is underway.
    assert!(matches!(
        h.coordinator.cancel(ride.id, CancelParty::Passenger).await,
        Err(DispatchError::Conflict { .. })
    ));
}

#[tokio::test]
async fn lifecycle_emits_offer_and_update_facts() {
    let h = harness(20);
    let drivers = seed_drivers(&h, 1).await;
    let mut rx = h.notifier.subscribe();

    let ride = h.coordinator.create_ride(request()).await.unwrap();
    h.coordinator.dispatch(ride.id).await.unwrap();
    h.coordinator.accept_offer(ride.id, drivers[0]).await.unwrap();

    let created = rx.recv().await.unwrap();
    assert_eq!(created.kind(), "ride:update");

    let offered = rx.recv().await.unwrap();
    assert_eq!(offered.kind(), "ride:offer");
    match offered {
        jitney_shared::RideEvent::Offer(e) => {
            assert_eq!(e.ride_id, ride.id);
            assert_eq!(e.driver_id, drivers[0]);
            assert_eq!(e.estimated_fare, ride.fare.fare);
        }
        other => panic!("expected an offer event, got {other:?}"),
    }

    let accepted = rx.recv().await.unwrap();
    match accepted {
        jitney_shared::RideEvent::Update(e) => {
            assert_eq!(e.status, "ACCEPTED");
            assert_eq!(e.driver_id, Some(drivers[0]));
            // The shared contact surfaces to the driver channel here.
            assert!(e.passenger_contact.is_some());
        }
        other => panic!("expected an update event, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_coordinates_are_rejected_before_any_mutation() {
    let h = harness(20);

    let bad = NewRideRequest {
        pickup: GeoPoint::new(95.0, 49.8),
        ..request()
    };
    let result = h.coordinator.create_ride(bad).await;
    assert!(matches!(result, Err(DispatchError::InvalidInput(_))));

    assert!(h
        .store
        .list_rides_by_status(RideStatus::Searching)
        .await
        .unwrap()
        .is_empty());
}
