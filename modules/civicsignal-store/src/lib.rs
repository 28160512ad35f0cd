//! Spatial index store for reports and clusters.
//!
//! The clustering engine talks to storage only through [`SpatialStore`].
//! Every write that must be atomic with another (a cluster write plus the
//! report back-reference) goes through [`SpatialStore::commit_assignment`].
//!
//! Two backends: [`PgStore`] (Postgres, transactional) and [`MemoryStore`]
//! (in-process, used by tests and local runs without a database).

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use traits::SpatialStore;
pub use types::{Assignment, ClusterPatch, NearQuery, ReportPatch};
