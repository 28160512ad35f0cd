//! Pure cluster arithmetic. No I/O.

use chrono::{DateTime, Utc};

use civicsignal_common::scoring::average_severity;
use civicsignal_common::{Cluster, ClusterStatus, NewCluster, PriorityWeights, Report};
use civicsignal_store::ClusterPatch;

/// A new cluster anchored at `report`'s location with the report as sole member.
pub fn found_cluster(report: &Report, weights: &PriorityWeights, now: DateTime<Utc>) -> NewCluster {
    let severity = u32::from(report.severity);
    let average = f64::from(report.severity);
    NewCluster {
        centroid: report.location,
        issue_type: report.issue_type,
        title: report.issue_type.cluster_title(),
        report_count: 1,
        total_severity_score: severity,
        average_severity: average,
        priority_score: weights.score(1, average),
        status: ClusterStatus::Reported,
        last_activity: now,
        member_report_ids: vec![report.id],
    }
}

/// Aggregates of `cluster` after folding in `report`. The centroid is not
/// part of the patch: a cluster stays anchored where it was founded.
pub fn merge_report(
    cluster: &Cluster,
    report: &Report,
    weights: &PriorityWeights,
    now: DateTime<Utc>,
) -> ClusterPatch {
    let report_count = cluster.report_count + 1;
    let total_severity_score = cluster.total_severity_score + u32::from(report.severity);
    let average = average_severity(total_severity_score, report_count);

    let mut member_report_ids = Vec::with_capacity(cluster.member_report_ids.len() + 1);
    member_report_ids.extend_from_slice(&cluster.member_report_ids);
    member_report_ids.push(report.id);

    ClusterPatch {
        report_count: Some(report_count),
        total_severity_score: Some(total_severity_score),
        average_severity: Some(average),
        priority_score: Some(weights.score(report_count, average)),
        last_activity: Some(now),
        member_report_ids: Some(member_report_ids),
        status: None,
    }
}
