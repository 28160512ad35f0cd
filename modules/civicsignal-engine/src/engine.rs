use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use civicsignal_common::error::Result;
use civicsignal_common::{
    CivicSignalError, Cluster, ClusterStatus, FileConfig, PriorityWeights, RawReport, Report,
    StatusFilter,
};
use civicsignal_store::{Assignment, ClusterPatch, NearQuery, SpatialStore, StoreResult};

use crate::aggregate::{found_cluster, merge_report};
use crate::intake::validate_report;

/// Runtime tunables, derived from the `[clustering]` and `[listing]` sections.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub radius_meters: f64,
    pub weights: PriorityWeights,
    pub max_conflict_retries: u32,
    pub conflict_retry_base: Duration,
    pub store_timeout: Duration,
    pub serialize_creates: bool,
    pub max_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&FileConfig::default())
    }
}

impl From<&FileConfig> for EngineConfig {
    fn from(file: &FileConfig) -> Self {
        Self {
            radius_meters: file.clustering.radius_meters,
            weights: file.clustering.weights(),
            max_conflict_retries: file.clustering.max_conflict_retries,
            conflict_retry_base: file.clustering.conflict_retry_base(),
            store_timeout: file.clustering.store_timeout(),
            serialize_creates: file.clustering.serialize_creates,
            max_page_size: file.listing.max_page_size,
        }
    }
}

/// A cluster with its member reports resolved, in member order.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterWithReports {
    #[serde(flatten)]
    pub cluster: Cluster,
    pub reports: Vec<Report>,
}

/// Entry point for every clustering operation. Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct ClusteringEngine {
    store: Arc<dyn SpatialStore>,
    config: EngineConfig,
}

impl ClusteringEngine {
    pub fn new(store: Arc<dyn SpatialStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    // -----------------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------------

    /// Validate and persist a report with status `new`.
    pub async fn submit(&self, raw: RawReport) -> Result<Report> {
        let new_report = validate_report(raw)?;
        let report = self
            .call("create_report", self.store.create_report(new_report))
            .await?;
        info!(
            report_id = %report.id,
            issue_type = %report.issue_type,
            severity = report.severity,
            "Report submitted"
        );
        Ok(report)
    }

    /// Submit then assign in one call.
    pub async fn ingest(&self, raw: RawReport) -> Result<(Report, Cluster)> {
        let report = self.submit(raw).await?;
        self.assign(report.id).await
    }

    // -----------------------------------------------------------------------
    // Clustering
    // -----------------------------------------------------------------------

    /// Merge a `new` report into the nearest open cluster of its issue type
    /// within the radius, or found a cluster for it.
    ///
    /// The decision and both writes commit together. A lost race against a
    /// concurrent writer backs off, then re-runs the search against fresh
    /// state, up to `max_conflict_retries` times.
    pub async fn assign(&self, report_id: Uuid) -> Result<(Report, Cluster)> {
        let report = self
            .call("get_report", self.store.get_report(report_id))
            .await?
            .ok_or_else(|| CivicSignalError::NotFound(format!("report {report_id}")))?;
        if report.is_clustered() {
            return Err(CivicSignalError::StaleState(format!(
                "report {report_id} is already clustered"
            )));
        }

        let query = NearQuery::open_clusters(
            report.location,
            self.config.radius_meters,
            report.issue_type,
        );
        let mut retries = 0u32;

        loop {
            let candidates = self
                .call("find_near", self.store.find_near(&query))
                .await?;

            let now = Utc::now();
            let assignment = match candidates.first() {
                Some(cluster) => Assignment::Merge {
                    report_id,
                    cluster_id: cluster.id,
                    patch: merge_report(cluster, &report, &self.config.weights, now),
                    expected_version: cluster.version,
                },
                None => Assignment::Create {
                    report_id,
                    cluster: found_cluster(&report, &self.config.weights, now),
                    guard: self.config.serialize_creates.then_some(query),
                },
            };
            let merging = matches!(assignment, Assignment::Merge { .. });

            match self
                .timed("commit_assignment", self.store.commit_assignment(assignment))
                .await?
            {
                Ok((report, cluster)) => {
                    if merging {
                        info!(
                            report_id = %report.id,
                            cluster_id = %cluster.id,
                            report_count = cluster.report_count,
                            priority_score = cluster.priority_score,
                            "Merged report into cluster"
                        );
                    } else {
                        info!(
                            report_id = %report.id,
                            cluster_id = %cluster.id,
                            issue_type = %cluster.issue_type,
                            "Created cluster"
                        );
                    }
                    return Ok((report, cluster));
                }
                Err(e) if e.is_conflict() && retries < self.config.max_conflict_retries => {
                    retries += 1;
                    debug!(report_id = %report_id, retries, error = %e, "Assignment lost a race, retrying");
                    tokio::time::sleep(self.conflict_backoff(retries)).await;
                }
                Err(e) if e.is_conflict() => {
                    warn!(report_id = %report_id, retries, error = %e, "Assignment retries exhausted");
                    return Err(CivicSignalError::Conflict(format!(
                        "report {report_id} could not be assigned after {retries} retries: {e}"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Move a cluster to `resolved`. Resolving a resolved cluster is a no-op.
    pub async fn resolve(&self, cluster_id: Uuid) -> Result<Cluster> {
        self.transition(cluster_id, ClusterStatus::Resolved).await
    }

    /// Move a cluster forward along its lifecycle. Staying in place is a
    /// no-op; moving backward is rejected.
    pub async fn transition(&self, cluster_id: Uuid, target: ClusterStatus) -> Result<Cluster> {
        let mut retries = 0u32;

        loop {
            let cluster = self
                .call("get_cluster", self.store.get_cluster(cluster_id))
                .await?
                .ok_or_else(|| CivicSignalError::NotFound(format!("cluster {cluster_id}")))?;

            if cluster.status == target {
                return Ok(cluster);
            }
            if !cluster.status.can_advance_to(target) {
                return Err(CivicSignalError::Validation(format!(
                    "cluster {cluster_id} cannot move from {} back to {target}",
                    cluster.status
                )));
            }

            let update = self.store.update_cluster(
                cluster_id,
                ClusterPatch::status(target),
                Some(cluster.version),
            );
            match self.timed("update_cluster", update).await? {
                Ok(updated) => {
                    info!(
                        cluster_id = %cluster_id,
                        from = %cluster.status,
                        to = %target,
                        "Cluster status changed"
                    );
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() && retries < self.config.max_conflict_retries => {
                    retries += 1;
                    debug!(cluster_id = %cluster_id, retries, "Status change lost a race, retrying");
                    tokio::time::sleep(self.conflict_backoff(retries)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------

    /// Clusters selected by `filter`, highest priority first. `limit` is
    /// capped at the configured page size.
    pub async fn list(&self, filter: StatusFilter, limit: Option<usize>) -> Result<Vec<Cluster>> {
        let limit = self.page_size(limit);
        self.call("list_clusters", self.store.list_clusters(filter, limit))
            .await
    }

    /// Like [`list`](Self::list), with each cluster's member reports embedded.
    pub async fn list_with_reports(
        &self,
        filter: StatusFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ClusterWithReports>> {
        let clusters = self.list(filter, limit).await?;
        let ids: Vec<Uuid> = clusters
            .iter()
            .flat_map(|c| c.member_report_ids.iter().copied())
            .collect();
        let mut reports: HashMap<Uuid, Report> = self
            .call("reports_by_ids", self.store.reports_by_ids(&ids))
            .await?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        Ok(clusters
            .into_iter()
            .map(|cluster| {
                let reports = cluster
                    .member_report_ids
                    .iter()
                    .filter_map(|id| reports.remove(id))
                    .collect();
                ClusterWithReports { cluster, reports }
            })
            .collect())
    }

    fn page_size(&self, limit: Option<usize>) -> usize {
        limit
            .unwrap_or(self.config.max_page_size)
            .min(self.config.max_page_size)
    }

    // -----------------------------------------------------------------------
    // Store plumbing
    // -----------------------------------------------------------------------

    /// Run a store call under the configured deadline. The outer error is the
    /// timeout; the inner result is left to the caller.
    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<StoreResult<T>>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(result) => Ok(result),
            Err(_) => {
                let timeout_ms =
                    u64::try_from(self.config.store_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(op, timeout_ms, "Store call timed out");
                Err(CivicSignalError::StoreUnavailable(format!(
                    "{op} timed out after {timeout_ms}ms"
                )))
            }
        }
    }

    /// Delay before retry number `retries` (1-based): the base doubled per
    /// prior retry, capped at the store timeout, plus up to one base of jitter.
    fn conflict_backoff(&self, retries: u32) -> Duration {
        let base = self.config.conflict_retry_base;
        let backoff = base
            .checked_mul(2u32.saturating_pow(retries.saturating_sub(1)))
            .unwrap_or(Duration::MAX)
            .min(self.config.store_timeout);
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(rand::rng().random_range(0..=base_ms));
        backoff.saturating_add(jitter)
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let result = self.timed(op, fut).await?;
        result.map_err(|e| {
            if !e.is_conflict() {
                warn!(op, error = %e, "Store call failed");
            }
            CivicSignalError::from(e)
        })
    }
}
