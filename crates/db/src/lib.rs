pub mod catalog;
pub mod connection;
pub mod store;

pub use catalog::load_catalog;
pub use connection::{connect, connect_from_config, connect_with_settings, DbPool};
pub use store::SqliteDataStore;
