use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Tariff parameters used by the fare estimator.
///
/// A ride snapshots the policy at creation time; later changes to the live
/// policy never retroactively alter an already-quoted fare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingPolicy {
    /// Flat fare covering the first `included_km`.
    pub base_fare: f64,
    /// Distance covered by the base fare before per-km billing starts.
    pub included_km: f64,
    /// Rate per kilometre beyond `included_km`.
    pub per_km_rate: f64,
    /// Platform share of the fare, as a fraction (0.10 = 10%).
    pub commission_rate: f64,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            base_fare: 3.50,
            included_km: 3.0,
            per_km_rate: 0.40,
            commission_rate: 0.10,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Pricing policy source unavailable: {0}")]
    Unavailable(String),
}

/// Source of the current pricing policy. Each returned value is authoritative
/// for one computation only; callers must not cache across rides.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn get_policy(&self) -> Result<PricingPolicy, PolicyError>;
}

/// In-process policy source with runtime tuning (admin adjusts tariffs while
/// the engine is live).
pub struct SharedPolicySource {
    inner: RwLock<PricingPolicy>,
}

impl SharedPolicySource {
    pub fn new(policy: PricingPolicy) -> Self {
        Self {
            inner: RwLock::new(policy),
        }
    }

    pub async fn set(&self, policy: PricingPolicy) {
        let mut guard = self.inner.write().await;
        *guard = policy;
    }
}

impl Default for SharedPolicySource {
    fn default() -> Self {
        Self::new(PricingPolicy::default())
    }
}

#[async_trait]
impl PolicySource for SharedPolicySource {
    async fn get_policy(&self) -> Result<PricingPolicy, PolicyError> {
        Ok(self.inner.read().await.clone())
    }
}
