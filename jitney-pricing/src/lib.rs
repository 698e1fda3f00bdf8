pub mod estimator;
pub mod policy;

pub use estimator::{estimate, FareQuote};
pub use policy::{PolicyError, PolicySource, PricingPolicy, SharedPolicySource};
