//! In-process store. Every operation takes one lock for its whole duration,
//! so `commit_assignment` is atomic and cancellation-safe: the lock is only
//! awaited before any mutation starts.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use civicsignal_common::{
    Cluster, ClusterStatus, NewCluster, NewReport, Report, ReportStatus, StatusFilter,
};

use crate::error::{StoreError, StoreResult};
use crate::traits::SpatialStore;
use crate::types::{Assignment, ClusterPatch, NearQuery, ReportPatch};

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    reports: HashMap<Uuid, Report>,
    clusters: HashMap<Uuid, Cluster>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every cluster regardless of status (for test assertions).
    pub async fn all_clusters(&self) -> Vec<Cluster> {
        let inner = self.inner.read().await;
        let mut clusters: Vec<Cluster> = inner.clusters.values().cloned().collect();
        clusters.sort_by_key(|c| c.created_at);
        clusters
    }

    /// Every report (for test assertions).
    pub async fn all_reports(&self) -> Vec<Report> {
        let inner = self.inner.read().await;
        let mut reports: Vec<Report> = inner.reports.values().cloned().collect();
        reports.sort_by_key(|r| r.created_at);
        reports
    }
}

impl Inner {
    fn find_near(&self, query: &NearQuery) -> Vec<Cluster> {
        let mut hits: Vec<(f64, &Cluster)> = self
            .clusters
            .values()
            .filter(|c| query.matches(c))
            .map(|c| (query.point.distance_meters(&c.centroid), c))
            .collect();
        hits.sort_by(|(da, a), (db, b)| {
            da.partial_cmp(db)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.into_iter().map(|(_, c)| c.clone()).collect()
    }

    /// Check that `id` may move out of `new`. No mutation.
    fn check_report_unclustered(&self, id: Uuid) -> StoreResult<()> {
        let report = self.reports.get(&id).ok_or(StoreError::ReportNotFound(id))?;
        if report.status != ReportStatus::New || report.cluster_id.is_some() {
            return Err(StoreError::ReportAlreadyClustered(id));
        }
        Ok(())
    }

    /// Check that `patch` may be applied to cluster `id`. No mutation.
    fn check_cluster_patch(
        &self,
        id: Uuid,
        patch: &ClusterPatch,
        expected_version: Option<i64>,
    ) -> StoreResult<()> {
        let cluster = self
            .clusters
            .get(&id)
            .ok_or(StoreError::ClusterNotFound(id))?;
        if let Some(expected) = expected_version {
            if cluster.version != expected {
                return Err(StoreError::VersionConflict {
                    id,
                    expected,
                    found: cluster.version,
                });
            }
        }
        if cluster.status == ClusterStatus::Resolved && patch.touches_aggregates() {
            return Err(StoreError::ClusterResolved(id));
        }
        Ok(())
    }

    fn apply_cluster_patch(&mut self, id: Uuid, patch: &ClusterPatch) -> StoreResult<Cluster> {
        let cluster = self
            .clusters
            .get_mut(&id)
            .ok_or(StoreError::ClusterNotFound(id))?;
        patch.apply(cluster);
        cluster.version += 1;
        Ok(cluster.clone())
    }

    fn insert_cluster(&mut self, cluster: NewCluster) -> Cluster {
        let cluster = cluster.into_cluster(Uuid::new_v4(), Utc::now());
        self.clusters.insert(cluster.id, cluster.clone());
        cluster
    }

    fn apply_report_patch(&mut self, id: Uuid, patch: ReportPatch) -> StoreResult<Report> {
        let report = self
            .reports
            .get_mut(&id)
            .ok_or(StoreError::ReportNotFound(id))?;
        report.status = patch.status;
        report.cluster_id = patch.cluster_id;
        Ok(report.clone())
    }
}

#[async_trait]
impl SpatialStore for MemoryStore {
    async fn create_report(&self, report: NewReport) -> StoreResult<Report> {
        let report = Report {
            id: Uuid::new_v4(),
            location: report.location,
            issue_type: report.issue_type,
            severity: report.severity,
            description: report.description,
            image_ref: report.image_ref,
            status: ReportStatus::New,
            cluster_id: None,
            created_at: Utc::now(),
        };
        self.inner
            .write()
            .await
            .reports
            .insert(report.id, report.clone());
        Ok(report)
    }

    async fn get_report(&self, id: Uuid) -> StoreResult<Option<Report>> {
        Ok(self.inner.read().await.reports.get(&id).cloned())
    }

    async fn reports_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Report>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.reports.get(id).cloned())
            .collect())
    }

    async fn update_report(&self, id: Uuid, patch: ReportPatch) -> StoreResult<Report> {
        let mut inner = self.inner.write().await;
        inner.check_report_unclustered(id)?;
        inner.apply_report_patch(id, patch)
    }

    async fn get_cluster(&self, id: Uuid) -> StoreResult<Option<Cluster>> {
        Ok(self.inner.read().await.clusters.get(&id).cloned())
    }

    async fn find_near(&self, query: &NearQuery) -> StoreResult<Vec<Cluster>> {
        Ok(self.inner.read().await.find_near(query))
    }

    async fn create_cluster(&self, cluster: NewCluster) -> StoreResult<Cluster> {
        Ok(self.inner.write().await.insert_cluster(cluster))
    }

    async fn update_cluster(
        &self,
        id: Uuid,
        patch: ClusterPatch,
        expected_version: Option<i64>,
    ) -> StoreResult<Cluster> {
        let mut inner = self.inner.write().await;
        inner.check_cluster_patch(id, &patch, expected_version)?;
        inner.apply_cluster_patch(id, &patch)
    }

    async fn commit_assignment(&self, assignment: Assignment) -> StoreResult<(Report, Cluster)> {
        let mut inner = self.inner.write().await;
        inner.check_report_unclustered(assignment.report_id())?;

        // All checks run before the first mutation so a failure leaves nothing behind.
        let (report_id, cluster) = match assignment {
            Assignment::Create {
                report_id,
                cluster,
                guard,
            } => {
                if let Some(query) = guard {
                    if let Some(existing) = inner.find_near(&query).first() {
                        return Err(StoreError::CandidateAppeared(existing.id));
                    }
                }
                (report_id, inner.insert_cluster(cluster))
            }
            Assignment::Merge {
                report_id,
                cluster_id,
                patch,
                expected_version,
            } => {
                inner.check_cluster_patch(cluster_id, &patch, Some(expected_version))?;
                (report_id, inner.apply_cluster_patch(cluster_id, &patch)?)
            }
        };

        let report = inner.apply_report_patch(report_id, ReportPatch::clustered(cluster.id))?;
        Ok((report, cluster))
    }

    async fn list_clusters(&self, filter: StatusFilter, limit: usize) -> StoreResult<Vec<Cluster>> {
        let inner = self.inner.read().await;
        let mut clusters: Vec<Cluster> = inner
            .clusters
            .values()
            .filter(|c| filter.matches(c.status))
            .cloned()
            .collect();
        clusters.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.last_activity.cmp(&a.last_activity))
                .then_with(|| a.id.cmp(&b.id))
        });
        clusters.truncate(limit);
        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicsignal_common::{GeoPoint, IssueType};

    fn new_report(lat: f64, lng: f64, issue_type: IssueType, severity: u8) -> NewReport {
        NewReport {
            location: GeoPoint::new(lat, lng),
            issue_type,
            severity,
            description: None,
            image_ref: None,
        }
    }

    fn seed_cluster(report: &Report, priority_score: f64) -> NewCluster {
        NewCluster {
            centroid: report.location,
            issue_type: report.issue_type,
            title: report.issue_type.cluster_title(),
            report_count: 1,
            total_severity_score: u32::from(report.severity),
            average_severity: f64::from(report.severity),
            priority_score,
            status: ClusterStatus::Reported,
            last_activity: Utc::now(),
            member_report_ids: vec![report.id],
        }
    }

    #[tokio::test]
    async fn create_report_starts_new() {
        let store = MemoryStore::new();
        let report = store
            .create_report(new_report(12.9, 77.6, IssueType::Pothole, 3))
            .await
            .unwrap();
        assert_eq!(report.status, ReportStatus::New);
        assert!(report.cluster_id.is_none());
        assert_eq!(store.get_report(report.id).await.unwrap(), Some(report));
    }

    #[tokio::test]
    async fn find_near_orders_nearest_first_and_filters() {
        let store = MemoryStore::new();
        let r = store
            .create_report(new_report(12.9, 77.6, IssueType::Pothole, 3))
            .await
            .unwrap();

        let far = store
            .create_cluster(NewCluster {
                centroid: GeoPoint::new(12.9003, 77.6),
                ..seed_cluster(&r, 80.0)
            })
            .await
            .unwrap();
        let near = store
            .create_cluster(NewCluster {
                centroid: GeoPoint::new(12.9001, 77.6),
                ..seed_cluster(&r, 80.0)
            })
            .await
            .unwrap();
        // Out of radius
        store
            .create_cluster(NewCluster {
                centroid: GeoPoint::new(12.91, 77.6),
                ..seed_cluster(&r, 80.0)
            })
            .await
            .unwrap();
        // Wrong type
        store
            .create_cluster(NewCluster {
                issue_type: IssueType::Garbage,
                ..seed_cluster(&r, 80.0)
            })
            .await
            .unwrap();

        let query = NearQuery::open_clusters(r.location, 50.0, IssueType::Pothole);
        let hits = store.find_near(&query).await.unwrap();
        let ids: Vec<Uuid> = hits.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![near.id, far.id]);
    }

    #[tokio::test]
    async fn find_near_breaks_distance_ties_by_id() {
        let store = MemoryStore::new();
        let r = store
            .create_report(new_report(12.9, 77.6, IssueType::Water, 2))
            .await
            .unwrap();
        let a = store.create_cluster(seed_cluster(&r, 60.0)).await.unwrap();
        let b = store.create_cluster(seed_cluster(&r, 60.0)).await.unwrap();

        let query = NearQuery::open_clusters(r.location, 50.0, IssueType::Water);
        let hits = store.find_near(&query).await.unwrap();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(hits.iter().map(|c| c.id).collect::<Vec<_>>(), expected);
    }

    #[tokio::test]
    async fn find_near_excludes_resolved() {
        let store = MemoryStore::new();
        let r = store
            .create_report(new_report(12.9, 77.6, IssueType::Pothole, 3))
            .await
            .unwrap();
        let c = store.create_cluster(seed_cluster(&r, 80.0)).await.unwrap();
        store
            .update_cluster(c.id, ClusterPatch::status(ClusterStatus::Resolved), None)
            .await
            .unwrap();

        let query = NearQuery::open_clusters(r.location, 50.0, IssueType::Pothole);
        assert!(store.find_near(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_cluster_checks_version() {
        let store = MemoryStore::new();
        let r = store
            .create_report(new_report(12.9, 77.6, IssueType::Pothole, 3))
            .await
            .unwrap();
        let c = store.create_cluster(seed_cluster(&r, 80.0)).await.unwrap();
        assert_eq!(c.version, 1);

        let patch = ClusterPatch {
            report_count: Some(2),
            ..Default::default()
        };
        let updated = store
            .update_cluster(c.id, patch.clone(), Some(1))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.report_count, 2);

        let err = store.update_cluster(c.id, patch, Some(1)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn resolved_cluster_aggregates_are_frozen() {
        let store = MemoryStore::new();
        let r = store
            .create_report(new_report(12.9, 77.6, IssueType::Pothole, 3))
            .await
            .unwrap();
        let c = store.create_cluster(seed_cluster(&r, 80.0)).await.unwrap();
        store
            .update_cluster(c.id, ClusterPatch::status(ClusterStatus::Resolved), None)
            .await
            .unwrap();

        let patch = ClusterPatch {
            report_count: Some(9),
            ..Default::default()
        };
        let err = store.update_cluster(c.id, patch, None).await.unwrap_err();
        assert!(matches!(err, StoreError::ClusterResolved(_)));
        assert_eq!(store.get_cluster(c.id).await.unwrap().unwrap().report_count, 1);
    }

    #[tokio::test]
    async fn update_report_sets_back_reference_once() {
        let store = MemoryStore::new();
        let r = store
            .create_report(new_report(12.9, 77.6, IssueType::Noise, 1))
            .await
            .unwrap();
        let cluster_id = Uuid::new_v4();
        let updated = store
            .update_report(r.id, ReportPatch::clustered(cluster_id))
            .await
            .unwrap();
        assert_eq!(updated.status, ReportStatus::Clustered);
        assert_eq!(updated.cluster_id, Some(cluster_id));

        let err = store
            .update_report(r.id, ReportPatch::clustered(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReportAlreadyClustered(_)));
    }

    #[tokio::test]
    async fn failed_merge_commit_leaves_report_untouched() {
        let store = MemoryStore::new();
        let r1 = store
            .create_report(new_report(12.9, 77.6, IssueType::Pothole, 3))
            .await
            .unwrap();
        let r2 = store
            .create_report(new_report(12.9, 77.6, IssueType::Pothole, 5))
            .await
            .unwrap();
        let c = store.create_cluster(seed_cluster(&r1, 80.0)).await.unwrap();

        let err = store
            .commit_assignment(Assignment::Merge {
                report_id: r2.id,
                cluster_id: c.id,
                patch: ClusterPatch {
                    report_count: Some(2),
                    ..Default::default()
                },
                expected_version: 7,
            })
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let r2_after = store.get_report(r2.id).await.unwrap().unwrap();
        assert_eq!(r2_after.status, ReportStatus::New);
        let c_after = store.get_cluster(c.id).await.unwrap().unwrap();
        assert_eq!(c_after, c);
    }

    #[tokio::test]
    async fn guarded_create_fails_when_candidate_exists() {
        let store = MemoryStore::new();
        let r1 = store
            .create_report(new_report(12.9, 77.6, IssueType::Pothole, 3))
            .await
            .unwrap();
        let r2 = store
            .create_report(new_report(12.9, 77.6, IssueType::Pothole, 4))
            .await
            .unwrap();
        let existing = store.create_cluster(seed_cluster(&r1, 80.0)).await.unwrap();

        let guard = NearQuery::open_clusters(r2.location, 50.0, IssueType::Pothole);
        let err = store
            .commit_assignment(Assignment::Create {
                report_id: r2.id,
                cluster: seed_cluster(&r2, 100.0),
                guard: Some(guard),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CandidateAppeared(id) if id == existing.id));
        assert_eq!(store.all_clusters().await.len(), 1);
    }

    #[tokio::test]
    async fn list_clusters_orders_by_priority_and_limits() {
        let store = MemoryStore::new();
        let r = store
            .create_report(new_report(12.9, 77.6, IssueType::Pothole, 3))
            .await
            .unwrap();
        for score in [40.0, 120.0, 80.0] {
            store.create_cluster(seed_cluster(&r, score)).await.unwrap();
        }
        let resolved = store.create_cluster(seed_cluster(&r, 500.0)).await.unwrap();
        store
            .update_cluster(resolved.id, ClusterPatch::status(ClusterStatus::Resolved), None)
            .await
            .unwrap();

        let active = store.list_clusters(StatusFilter::Active, 2).await.unwrap();
        let scores: Vec<f64> = active.iter().map(|c| c.priority_score).collect();
        assert_eq!(scores, vec![120.0, 80.0]);

        let done = store.list_clusters(StatusFilter::Resolved, 100).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, resolved.id);
    }

    #[tokio::test]
    async fn reports_by_ids_preserves_order() {
        let store = MemoryStore::new();
        let a = store
            .create_report(new_report(1.0, 1.0, IssueType::Light, 1))
            .await
            .unwrap();
        let b = store
            .create_report(new_report(2.0, 2.0, IssueType::Light, 2))
            .await
            .unwrap();
        let got = store
            .reports_by_ids(&[b.id, Uuid::new_v4(), a.id])
            .await
            .unwrap();
        assert_eq!(got.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b.id, a.id]);
    }
}
