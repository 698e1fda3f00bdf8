pub mod driver;
pub mod error;
pub mod geo;
pub mod offer;
pub mod repository;
pub mod ride;

pub use driver::DriverCandidate;
pub use error::{ConflictReason, DirectoryError, DispatchError, StoreError};
pub use geo::GeoPoint;
pub use offer::{Offer, OfferOutcome};
pub use repository::{DriverDirectory, RideNotifier, RideStore};
pub use ride::{PaymentMethod, QueuedCandidate, Ride, RideStatus, TransitionError};
