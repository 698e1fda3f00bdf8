use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// How long a driver has to accept an offer before it times out.
    #[serde(default = "default_offer_window_secs")]
    pub offer_window_secs: u64,
    /// Length cap for a ride's ranked candidate queue.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Drivers below this wallet balance are not dispatchable.
    #[serde(default = "default_min_balance")]
    pub min_balance: f64,
    /// Location fixes older than this are not dispatchable.
    #[serde(default = "default_location_max_age_secs")]
    pub location_max_age_secs: u64,
}

fn default_offer_window_secs() -> u64 {
    20
}
fn default_max_candidates() -> usize {
    5
}
fn default_min_balance() -> f64 {
    -10.0
}
fn default_location_max_age_secs() -> u64 {
    120
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            offer_window_secs: default_offer_window_secs(),
            max_candidates: default_max_candidates(),
            min_balance: default_min_balance(),
            location_max_age_secs: default_location_max_age_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RankingConfig {
    /// Candidates farther than this from the pickup are filtered out.
    #[serde(default = "default_search_radius_km")]
    pub search_radius_km: f64,
    #[serde(default = "default_distance_weight")]
    pub distance_weight: f64,
    #[serde(default = "default_rating_weight")]
    pub rating_weight: f64,
    #[serde(default = "default_rejection_weight")]
    pub rejection_weight: f64,
}

fn default_search_radius_km() -> f64 {
    6.0
}
fn default_distance_weight() -> f64 {
    1.0
}
fn default_rating_weight() -> f64 {
    0.8
}
fn default_rejection_weight() -> f64 {
    0.3
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            search_radius_km: default_search_radius_km(),
            distance_weight: default_distance_weight(),
            rating_weight: default_rating_weight(),
            rejection_weight: default_rejection_weight(),
        }
    }
}

/// Startup tariff values; the live policy may be retuned at runtime through
/// `jitney_pricing::SharedPolicySource`.
#[derive(Debug, Deserialize, Clone)]
pub struct PricingConfig {
    #[serde(default = "default_base_fare")]
    pub base_fare: f64,
    #[serde(default = "default_included_km")]
    pub included_km: f64,
    #[serde(default = "default_per_km_rate")]
    pub per_km_rate: f64,
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,
}

fn default_base_fare() -> f64 {
    3.50
}
fn default_included_km() -> f64 {
    3.0
}
fn default_per_km_rate() -> f64 {
    0.40
}
fn default_commission_rate() -> f64 {
    0.10
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_fare: default_base_fare(),
            included_km: default_included_km(),
            per_km_rate: default_per_km_rate(),
            commission_rate: default_commission_rate(),
        }
    }
}

impl From<PricingConfig> for jitney_pricing::PricingPolicy {
    fn from(c: PricingConfig) -> Self {
        Self {
            base_fare: c.base_fare,
            included_km: c.included_km,
            per_km_rate: c.per_km_rate,
            commission_rate: c.commission_rate,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    /// Postgres connection string; unset means the embedder runs on the
    /// in-memory store.
    #[serde(default)]
    pub url: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(config::File::with_name("config/default").required(false))
            // Add in the current environment file, default 'development';
            // optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add in a local configuration file; shouldn't be checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg. `JITNEY__DISPATCH__OFFER_WINDOW_SECS=30`
            .add_source(config::Environment::with_prefix("JITNEY").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
