use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use civicsignal_common::{Cluster, NewCluster, NewReport, Report, StatusFilter};

use crate::error::StoreResult;
use crate::types::{Assignment, ClusterPatch, NearQuery, ReportPatch};

/// Durable storage of reports and clusters with radius search and a
/// priority ordering.
///
/// Implemented by `PgStore` (postgres) and `MemoryStore` (tests, local runs).
/// Also implemented for `Arc<S>` so a store can be shared for assertions.
#[async_trait]
pub trait SpatialStore: Send + Sync {
    /// Persist a new report with status `new`. Assigns id and `created_at`.
    async fn create_report(&self, report: NewReport) -> StoreResult<Report>;

    async fn get_report(&self, id: Uuid) -> StoreResult<Option<Report>>;

    /// Reports for `ids`, in the order given. Unknown ids are skipped.
    async fn reports_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Report>>;

    /// Set a report's status and cluster back-reference. Fails with
    /// `ReportAlreadyClustered` if the report has left `new` already.
    async fn update_report(&self, id: Uuid, patch: ReportPatch) -> StoreResult<Report>;

    async fn get_cluster(&self, id: Uuid) -> StoreResult<Option<Cluster>>;

    /// Clusters matching `query`, nearest first, ties broken by id.
    async fn find_near(&self, query: &NearQuery) -> StoreResult<Vec<Cluster>>;

    /// Insert a cluster. Assigns id, `created_at`, and version 1.
    async fn create_cluster(&self, cluster: NewCluster) -> StoreResult<Cluster>;

    /// Apply `patch`, bumping the version. With `expected_version`, fails with
    /// `VersionConflict` unless the stored version matches.
    async fn update_cluster(
        &self,
        id: Uuid,
        patch: ClusterPatch,
        expected_version: Option<i64>,
    ) -> StoreResult<Cluster>;

    /// Commit a clustering decision atomically.
    async fn commit_assignment(&self, assignment: Assignment) -> StoreResult<(Report, Cluster)>;

    /// Clusters selected by `filter`, highest priority first, at most `limit`.
    async fn list_clusters(&self, filter: StatusFilter, limit: usize) -> StoreResult<Vec<Cluster>>;
}

// ---------------------------------------------------------------------------
// Arc<S> blanket
// ---------------------------------------------------------------------------

#[async_trait]
impl<S: SpatialStore + ?Sized> SpatialStore for Arc<S> {
    async fn create_report(&self, report: NewReport) -> StoreResult<Report> {
        (**self).create_report(report).await
    }

    async fn get_report(&self, id: Uuid) -> StoreResult<Option<Report>> {
        (**self).get_report(id).await
    }

    async fn reports_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Report>> {
        (**self).reports_by_ids(ids).await
    }

    async fn update_report(&self, id: Uuid, patch: ReportPatch) -> StoreResult<Report> {
        (**self).update_report(id, patch).await
    }

    async fn get_cluster(&self, id: Uuid) -> StoreResult<Option<Cluster>> {
        (**self).get_cluster(id).await
    }

    async fn find_near(&self, query: &NearQuery) -> StoreResult<Vec<Cluster>> {
        (**self).find_near(query).await
    }

    async fn create_cluster(&self, cluster: NewCluster) -> StoreResult<Cluster> {
        (**self).create_cluster(cluster).await
    }

    async fn update_cluster(
        &self,
        id: Uuid,
        patch: ClusterPatch,
        expected_version: Option<i64>,
    ) -> StoreResult<Cluster> {
        (**self).update_cluster(id, patch, expected_version).await
    }

    async fn commit_assignment(&self, assignment: Assignment) -> StoreResult<(Report, Cluster)> {
        (**self).commit_assignment(assignment).await
    }

    async fn list_clusters(&self, filter: StatusFilter, limit: usize) -> StoreResult<Vec<Cluster>> {
        (**self).list_clusters(filter, limit).await
    }
}
