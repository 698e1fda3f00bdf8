pub mod app_config;
pub mod database;
pub mod events;
pub mod memory;
pub mod pg;

pub use app_config::Config;
pub use database::DbClient;
pub use events::BroadcastNotifier;
pub use memory::{MemoryDriverDirectory, MemoryRideStore};
pub use pg::PgRideStore;
