pub mod config;
pub mod error;
pub mod geo;
pub mod scoring;
pub mod types;

pub use config::{ClusteringConfig, Config, FileConfig, ListingConfig, ServerConfig};
pub use error::CivicSignalError;
pub use scoring::PriorityWeights;
pub use types::*;
