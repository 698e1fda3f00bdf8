pub mod coordinator;
pub mod ranking;
pub mod scheduler;

pub use coordinator::{CancelParty, DispatchCoordinator, DispatchOutcome, NewRideRequest};
pub use ranking::{rank, RankedCandidate};
pub use scheduler::{OfferScheduler, OfferTimeout, Resolution};
