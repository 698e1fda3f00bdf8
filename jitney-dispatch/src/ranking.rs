use jitney_core::geo::haversine_km;
use jitney_core::{DriverCandidate, GeoPoint};
use jitney_store::app_config::RankingConfig;
use uuid::Uuid;

/// A candidate that survived the radius filter, with its score and its
/// distance to the pickup point.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub driver_id: Uuid,
    pub pickup_distance_km: f64,
    pub score: f64,
}

/// Score and order candidates for a pickup point.
///
/// Candidates beyond `search_radius_km` are dropped. The score is a linear
/// weighted combination: closer is strictly better at fixed rating and
/// rejection count, higher-rated is strictly better at fixed distance, and
/// past rejections push a driver down. Ties break by driver id ascending so
/// the ordering is deterministic. Returns at most `limit` candidates; an
/// empty input yields an empty ranking, not an error.
pub fn rank(
    pickup: GeoPoint,
    candidates: &[DriverCandidate],
    limit: usize,
    config: &RankingConfig,
) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidates
        .iter()
        .map(|c| {
            let distance = haversine_km(c.location, pickup);
            RankedCandidate {
                driver_id: c.id,
                pickup_distance_km: distance,
                score: c.rating * config.rating_weight
                    - distance * config.distance_weight
                    - f64::from(c.rejection_count) * config.rejection_weight,
            }
        })
        .filter(|r| r.pickup_distance_km <= config.search_radius_km)
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.driver_id.cmp(&b.driver_id))
    });
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pickup() -> GeoPoint {
        GeoPoint::new(40.4093, 49.8671)
    }

    fn candidate(id: Uuid, offset_lat: f64, rating: f64, rejections: u32) -> DriverCandidate {
        DriverCandidate {
            id,
            location: GeoPoint::new(40.4093 + offset_lat, 49.8671),
            approved: true,
            online: true,
            balance: 10.0,
            rating,
            rejection_count: rejections,
            located_at: Utc::now(),
        }
    }

    #[test]
    fn closer_driver_ranks_first_at_equal_rating() {
        let near = candidate(Uuid::new_v4(), 0.005, 4.5, 0);
        let far = candidate(Uuid::new_v4(), 0.030, 4.5, 0);

        let ranked = rank(pickup(), &[far.clone(), near.clone()], 5, &RankingConfig::default());
        assert_eq!(ranked[0].driver_id, near.id);
        assert_eq!(ranked[1].driver_id, far.id);
    }

    #[test]
    fn higher_rating_wins_at_equal_distance() {
        let low = candidate(Uuid::new_v4(), 0.010, 3.0, 0);
        let high = candidate(Uuid::new_v4(), 0.010, 5.0, 0);

        let ranked = rank(pickup(), &[low.clone(), high.clone()], 5, &RankingConfig::default());
        assert_eq!(ranked[0].driver_id, high.id);
    }

    #[test]
    fn rejections_lower_the_score() {
        let clean = candidate(Uuid::new_v4(), 0.010, 4.5, 0);
        let penalized = candidate(Uuid::new_v4(), 0.010, 4.5, 8);

        let ranked = rank(pickup(), &[penalized.clone(), clean.clone()], 5, &RankingConfig::default());
        assert_eq!(ranked[0].driver_id, clean.id);
    }

    #[test]
    fn out_of_radius_candidates_are_dropped() {
        // ~0.1 deg latitude is ~11 km, past the 6 km default radius.
        let outside = candidate(Uuid::new_v4(), 0.1, 5.0, 0);
        let inside = candidate(Uuid::new_v4(), 0.01, 3.0, 0);

        let ranked = rank(pickup(), &[outside, inside.clone()], 5, &RankingConfig::default());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].driver_id, inside.id);
    }

    #[test]
    fn limit_caps_the_result() {
        let candidates: Vec<_> = (0..10)
            .map(|_| candidate(Uuid::new_v4(), 0.01, 4.5, 0))
            .collect();

        let ranked = rank(pickup(), &candidates, 3, &RankingConfig::default());
        assert_eq!(ranked.len(), 3);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(rank(pickup(), &[], 5, &RankingConfig::default()).is_empty());
    }

    #[test]
    fn equal_scores_break_ties_by_id_ascending() {
        let a = candidate(Uuid::new_v4(), 0.010, 4.5, 0);
        let b = DriverCandidate {
            id: Uuid::new_v4(),
            ..a.clone()
        };

        let ranked = rank(pickup(), &[a.clone(), b.clone()], 5, &RankingConfig::default());
        let mut expected = [a.id, b.id];
        expected.sort();
        assert_eq!(ranked[0].driver_id, expected[0]);
        assert_eq!(ranked[1].driver_id, expected[1]);
    }

    // Property check over random candidate sets: at fixed rating and
    // rejection count a strictly closer candidate never ranks after a
    // farther one, and at fixed distance a strictly higher-rated candidate
    // never ranks after a lower-rated one.
    #[test]
    fn monotonicity_holds_over_random_sets() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let config = RankingConfig::default();

        for _ in 0..200 {
            let candidates: Vec<_> = (0..12)
                .map(|_| {
                    candidate(
                        Uuid::new_v4(),
                        rng.gen_range(0.0..0.05),
                        rng.gen_range(1.0..5.0),
                        rng.gen_range(0..6),
                    )
                })
                .collect();

            let ranked = rank(pickup(), &candidates, usize::MAX, &config);
            let by_id = |id: Uuid| candidates.iter().find(|c| c.id == id).unwrap();

            for (i, earlier) in ranked.iter().enumerate() {
                for later in &ranked[i + 1..] {
                    let (e, l) = (by_id(earlier.driver_id), by_id(later.driver_id));

                    if e.rating == l.rating && e.rejection_count == l.rejection_count {
                        assert!(
                            earlier.pickup_distance_km <= later.pickup_distance_km,
                            "distance inversion at fixed rating/rejections"
                        );
                    }
                    if earlier.pickup_distance_km == later.pickup_distance_km
                        && e.rejection_count == l.rejection_count
                    {
                        assert!(e.rating >= l.rating, "rating inversion at fixed distance");
                    }
                }
            }
        }
    }
}
