use serde::{Deserialize, Serialize};

use crate::policy::PricingPolicy;

/// Fare plus the platform's commission cut, both rounded to 2 decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FareQuote {
    pub fare: f64,
    pub commission: f64,
}

/// Estimate the fare for a trip of `distance_km` under `policy`.
///
/// `fare = base + max(0, d - included) * per_km_rate`, rounded half-up to
/// 2 decimals; commission is the policy's fraction of the rounded fare.
/// Non-finite or negative distance is clamped to 0 rather than rejected:
/// distance is frequently derived from noisy coordinates and the caller is
/// expected to have validated its inputs already.
pub fn estimate(distance_km: f64, policy: &PricingPolicy) -> FareQuote {
    let distance_km = if distance_km.is_finite() {
        distance_km.max(0.0)
    } else {
        0.0
    };

    let billable_km = (distance_km - policy.included_km).max(0.0);
    let fare = round2(policy.base_fare + billable_km * policy.per_km_rate);
    let commission = round2(fare * policy.commission_rate);

    FareQuote { fare, commission }
}

/// Round half-up to 2 decimal places.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
