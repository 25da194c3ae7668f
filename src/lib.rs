pub mod build;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod index;
pub mod queue;
pub mod reconcile;
pub mod runtime;
pub mod store;
pub mod version;

pub use catalog::{CatalogHandle, PackageRecord, PackageStatus};
pub use config::Config;
pub use engine::Engine;

/// User Agent string for index downloads
pub const USER_AGENT: &str = concat!("debfarm/", env!("CARGO_PKG_VERSION"));
