//! Report intake and proximity clustering.
//!
//! [`ClusteringEngine`] validates reports, folds each one into the nearest
//! open cluster of the same issue type (or founds a new one), drives the
//! cluster lifecycle, and lists clusters for triage. All persistence goes
//! through a [`civicsignal_store::SpatialStore`].

pub mod aggregate;
pub mod engine;
pub mod intake;

pub use engine::{ClusterWithReports, ClusteringEngine, EngineConfig};
pub use intake::validate_report;
