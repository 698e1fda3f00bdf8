pub mod models;
pub mod pii;

pub use models::events::{
    RideCancelledEvent, RideEvent, RideOfferEvent, RideUpdateEvent,
};
pub use pii::Masked;
