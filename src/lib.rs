//! Flat-file storage and click analytics for a URL shortener.
//!
//! Every table is a CSV file in one data directory. [`Store`] ties the tables
//! together and is what the request layer and the maintenance CLI talk to.

pub mod cache;
pub mod clicks;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod migration;
pub mod models;
pub mod password;
pub mod rate_limit;
pub mod stats;
pub mod store;
pub mod table;
pub mod urls;
pub mod user_agents;
pub mod users;
pub mod visit;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use store::Store;
