//! Request types for the store contract.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use civicsignal_common::{Cluster, ClusterStatus, GeoPoint, IssueType, NewCluster, ReportStatus};

/// Radius query for candidate clusters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearQuery {
    pub point: GeoPoint,
    pub radius_meters: f64,
    pub issue_type: IssueType,
    pub exclude_status: ClusterStatus,
}

impl NearQuery {
    /// Open clusters of `issue_type` within `radius_meters` of `point`.
    pub fn open_clusters(point: GeoPoint, radius_meters: f64, issue_type: IssueType) -> Self {
        Self {
            point,
            radius_meters,
            issue_type,
            exclude_status: ClusterStatus::Resolved,
        }
    }

    pub fn matches(&self, cluster: &Cluster) -> bool {
        cluster.issue_type == self.issue_type
            && cluster.status != self.exclude_status
            && self.point.distance_meters(&cluster.centroid) <= self.radius_meters
    }
}

/// Partial update of a cluster. `None` leaves a field untouched.
/// Centroid, issue type, and title are not patchable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterPatch {
    pub report_count: Option<u32>,
    pub total_severity_score: Option<u32>,
    pub average_severity: Option<f64>,
    pub priority_score: Option<f64>,
    pub last_activity: Option<DateTime<Utc>>,
    pub member_report_ids: Option<Vec<Uuid>>,
    pub status: Option<ClusterStatus>,
}

impl ClusterPatch {
    pub fn status(status: ClusterStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Whether this patch writes any aggregate (frozen once resolved).
    pub fn touches_aggregates(&self) -> bool {
        self.report_count.is_some()
            || self.total_severity_score.is_some()
            || self.average_severity.is_some()
            || self.priority_score.is_some()
            || self.last_activity.is_some()
            || self.member_report_ids.is_some()
    }

    pub fn apply(&self, cluster: &mut Cluster) {
        if let Some(v) = self.report_count {
            cluster.report_count = v;
        }
        if let Some(v) = self.total_severity_score {
            cluster.total_severity_score = v;
        }
        if let Some(v) = self.average_severity {
            cluster.average_severity = v;
        }
        if let Some(v) = self.priority_score {
            cluster.priority_score = v;
        }
        if let Some(v) = self.last_activity {
            cluster.last_activity = v;
        }
        if let Some(v) = &self.member_report_ids {
            cluster.member_report_ids = v.clone();
        }
        if let Some(v) = self.status {
            cluster.status = v;
        }
    }
}

/// Report fields writable after creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportPatch {
    pub status: ReportStatus,
    pub cluster_id: Option<Uuid>,
}

impl ReportPatch {
    pub fn clustered(cluster_id: Uuid) -> Self {
        Self {
            status: ReportStatus::Clustered,
            cluster_id: Some(cluster_id),
        }
    }
}

/// One clustering decision, committed atomically: the cluster write and the
/// report's `new -> clustered` transition land together or not at all.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Create {
        report_id: Uuid,
        cluster: NewCluster,
        /// When set, the store re-runs this search inside its critical
        /// section and fails with `CandidateAppeared` if anything matches.
        guard: Option<NearQuery>,
    },
    Merge {
        report_id: Uuid,
        cluster_id: Uuid,
        patch: ClusterPatch,
        expected_version: i64,
    },
}

impl Assignment {
    pub fn report_id(&self) -> Uuid {
        match self {
            Assignment::Create { report_id, .. } | Assignment::Merge { report_id, .. } => {
                *report_id
            }
        }
    }
}
