//! Postgres-backed store for reports and clusters.
//!
//! Radius search uses a GiST index over `point(centroid_lng, centroid_lat)`
//! as a bounding-box prefilter, then an exact haversine check.
//! `commit_assignment` runs in a single transaction: the report row is locked
//! first, and the cluster update is conditional on the expected version.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgExecutor, PgPool};
use tracing::debug;
use uuid::Uuid;

use civicsignal_common::geo::BoundingBox;
use civicsignal_common::{
    Cluster, ClusterStatus, GeoPoint, NewCluster, NewReport, Report, ReportStatus, StatusFilter,
};

use crate::error::{StoreError, StoreResult};
use crate::traits::SpatialStore;
use crate::types::{Assignment, ClusterPatch, NearQuery, ReportPatch};

const CLUSTER_COLUMNS: &str = "id, centroid_lat, centroid_lng, issue_type, title, report_count, \
     total_severity_score, average_severity, priority_score, status, last_activity, \
     member_report_ids, version, created_at";

const REPORT_COLUMNS: &str =
    "id, lat, lng, issue_type, severity, description, image_ref, status, cluster_id, created_at";

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a bounded pool. `acquire_timeout` keeps a saturated pool
    /// from stalling callers indefinitely.
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        Ok(())
    }
}

#[async_trait]
impl SpatialStore for PgStore {
    async fn create_report(&self, report: NewReport) -> StoreResult<Report> {
        let row = sqlx::query_as::<_, ReportRow>(&format!(
            r#"
            INSERT INTO reports (id, lat, lng, issue_type, severity, description, image_ref, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'new')
            RETURNING {REPORT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(report.location.lat)
        .bind(report.location.lng)
        .bind(report.issue_type.as_str())
        .bind(i16::from(report.severity))
        .bind(&report.description)
        .bind(&report.image_ref)
        .fetch_one(&self.pool)
        .await?;

        row.into_report()
    }

    async fn get_report(&self, id: Uuid) -> StoreResult<Option<Report>> {
        let row = sqlx::query_as::<_, ReportRow>(&format!(
            "SELECT {REPORT_COLUMNS} FROM reports WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReportRow::into_report).transpose()
    }

    async fn reports_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Report>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, ReportRow>(&format!(
            "SELECT {REPORT_COLUMNS} FROM reports WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_id: HashMap<Uuid, Report> = HashMap::with_capacity(rows.len());
        for row in rows {
            let report = row.into_report()?;
            by_id.insert(report.id, report);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn update_report(&self, id: Uuid, patch: ReportPatch) -> StoreResult<Report> {
        let mut conn = self.pool.acquire().await?;
        mark_report(&mut conn, id, patch).await
    }

    async fn get_cluster(&self, id: Uuid) -> StoreResult<Option<Cluster>> {
        let row = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ClusterRow::into_cluster).transpose()
    }

    async fn find_near(&self, query: &NearQuery) -> StoreResult<Vec<Cluster>> {
        find_near(&self.pool, query).await
    }

    async fn create_cluster(&self, cluster: NewCluster) -> StoreResult<Cluster> {
        insert_cluster(&self.pool, cluster).await
    }

    async fn update_cluster(
        &self,
        id: Uuid,
        patch: ClusterPatch,
        expected_version: Option<i64>,
    ) -> StoreResult<Cluster> {
        let mut tx = self.pool.begin().await?;
        let cluster = patch_cluster(&mut *tx, id, &patch, expected_version).await?;
        tx.commit().await?;
        Ok(cluster)
    }

    async fn commit_assignment(&self, assignment: Assignment) -> StoreResult<(Report, Cluster)> {
        let report_id = assignment.report_id();
        let mut tx = self.pool.begin().await?;

        // Lock the report so a concurrent assign of the same report waits here
        // and then sees it clustered.
        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM reports WHERE id = $1 FOR UPDATE",
        )
        .bind(report_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::ReportNotFound(report_id))?;
        if status != ReportStatus::New.as_str() {
            return Err(StoreError::ReportAlreadyClustered(report_id));
        }

        let cluster = match assignment {
            Assignment::Create { cluster, guard, .. } => {
                if let Some(query) = guard {
                    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                        .bind(format!("civicsignal:create:{}", query.issue_type))
                        .execute(&mut *tx)
                        .await?;
                    if let Some(existing) = find_near(&mut *tx, &query).await?.first() {
                        return Err(StoreError::CandidateAppeared(existing.id));
                    }
                }
                insert_cluster(&mut *tx, cluster).await?
            }
            Assignment::Merge {
                cluster_id,
                patch,
                expected_version,
                ..
            } => patch_cluster(&mut *tx, cluster_id, &patch, Some(expected_version)).await?,
        };

        let report = mark_report(&mut *tx, report_id, ReportPatch::clustered(cluster.id)).await?;
        tx.commit().await?;

        debug!(report_id = %report.id, cluster_id = %cluster.id, version = cluster.version, "Assignment committed");
        Ok((report, cluster))
    }

    async fn list_clusters(&self, filter: StatusFilter, limit: usize) -> StoreResult<Vec<Cluster>> {
        let rows = sqlx::query_as::<_, ClusterRow>(&format!(
            r#"
            SELECT {CLUSTER_COLUMNS}
            FROM clusters
            WHERE (status = 'resolved') = $1
            ORDER BY priority_score DESC, last_activity DESC, id ASC
            LIMIT $2
            "#
        ))
        .bind(filter == StatusFilter::Resolved)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ClusterRow::into_cluster).collect()
    }
}

// ---------------------------------------------------------------------------
// Executor-generic helpers (shared by pool and transaction paths)
// ---------------------------------------------------------------------------

async fn find_near<'e, E: PgExecutor<'e>>(executor: E, query: &NearQuery) -> StoreResult<Vec<Cluster>> {
    let bbox = BoundingBox::around(query.point.lat, query.point.lng, query.radius_meters);
    let rows = sqlx::query_as::<_, ClusterRow>(&format!(
        r#"
        SELECT {CLUSTER_COLUMNS}
        FROM (
            SELECT {CLUSTER_COLUMNS},
                   haversine_meters($1, $2, centroid_lat, centroid_lng) AS distance_m
            FROM clusters
            WHERE issue_type = $3
              AND status <> $4
              AND point(centroid_lng, centroid_lat) <@ box(point($5, $6), point($7, $8))
        ) near
        WHERE distance_m <= $9
        ORDER BY distance_m ASC, id ASC
        "#
    ))
    .bind(query.point.lat)
    .bind(query.point.lng)
    .bind(query.issue_type.as_str())
    .bind(query.exclude_status.as_str())
    .bind(bbox.min_lng)
    .bind(bbox.min_lat)
    .bind(bbox.max_lng)
    .bind(bbox.max_lat)
    .bind(query.radius_meters)
    .fetch_all(executor)
    .await?;

    rows.into_iter().map(ClusterRow::into_cluster).collect()
}

async fn insert_cluster<'e, E: PgExecutor<'e>>(executor: E, cluster: NewCluster) -> StoreResult<Cluster> {
    let row = sqlx::query_as::<_, ClusterRow>(&format!(
        r#"
        INSERT INTO clusters
            (id, centroid_lat, centroid_lng, issue_type, title, report_count,
             total_severity_score, average_severity, priority_score, status,
             last_activity, member_report_ids, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 1)
        RETURNING {CLUSTER_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(cluster.centroid.lat)
    .bind(cluster.centroid.lng)
    .bind(cluster.issue_type.as_str())
    .bind(&cluster.title)
    .bind(to_i32(cluster.report_count)?)
    .bind(to_i32(cluster.total_severity_score)?)
    .bind(cluster.average_severity)
    .bind(cluster.priority_score)
    .bind(cluster.status.as_str())
    .bind(cluster.last_activity)
    .bind(&cluster.member_report_ids)
    .fetch_one(executor)
    .await?;

    row.into_cluster()
}

/// Conditional update. On zero rows affected, re-reads the row to say why.
async fn patch_cluster(
    conn: &mut PgConnection,
    id: Uuid,
    patch: &ClusterPatch,
    expected_version: Option<i64>,
) -> StoreResult<Cluster> {
    let row = sqlx::query_as::<_, ClusterRow>(&format!(
        r#"
        UPDATE clusters SET
            report_count         = COALESCE($2, report_count),
            total_severity_score = COALESCE($3, total_severity_score),
            average_severity     = COALESCE($4, average_severity),
            priority_score       = COALESCE($5, priority_score),
            last_activity        = COALESCE($6, last_activity),
            member_report_ids    = COALESCE($7, member_report_ids),
            status               = COALESCE($8, status),
            version              = version + 1
        WHERE id = $1
          AND ($9::BIGINT IS NULL OR version = $9)
          AND (status <> 'resolved' OR NOT $10)
        RETURNING {CLUSTER_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(patch.report_count.map(to_i32).transpose()?)
    .bind(patch.total_severity_score.map(to_i32).transpose()?)
    .bind(patch.average_severity)
    .bind(patch.priority_score)
    .bind(patch.last_activity)
    .bind(patch.member_report_ids.as_deref())
    .bind(patch.status.map(|s| s.as_str()))
    .bind(expected_version)
    .bind(patch.touches_aggregates())
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = row {
        return row.into_cluster();
    }

    let current = sqlx::query_as::<_, (i64, String)>(
        "SELECT version, status FROM clusters WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    match current {
        None => Err(StoreError::ClusterNotFound(id)),
        Some((found, _)) if expected_version.is_some_and(|v| v != found) => {
            Err(StoreError::VersionConflict {
                id,
                expected: expected_version.unwrap_or_default(),
                found,
            })
        }
        Some(_) => Err(StoreError::ClusterResolved(id)),
    }
}

/// `new -> clustered`, at most once.
async fn mark_report(
    conn: &mut PgConnection,
    id: Uuid,
    patch: ReportPatch,
) -> StoreResult<Report> {
    let row = sqlx::query_as::<_, ReportRow>(&format!(
        r#"
        UPDATE reports SET status = $2, cluster_id = $3
        WHERE id = $1 AND status = 'new'
        RETURNING {REPORT_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(patch.status.as_str())
    .bind(patch.cluster_id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => row.into_report(),
        None => {
            let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM reports WHERE id = $1")
                .bind(id)
                .fetch_one(&mut *conn)
                .await?;
            if exists == 0 {
                Err(StoreError::ReportNotFound(id))
            } else {
                Err(StoreError::ReportAlreadyClustered(id))
            }
        }
    }
}

fn to_i32(v: u32) -> StoreResult<i32> {
    i32::try_from(v).map_err(|_| StoreError::InvalidRow(format!("{v} does not fit in INTEGER")))
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct ClusterRow {
    id: Uuid,
    centroid_lat: f64,
    centroid_lng: f64,
    issue_type: String,
    title: String,
    report_count: i32,
    total_severity_score: i32,
    average_severity: f64,
    priority_score: f64,
    status: String,
    last_activity: DateTime<Utc>,
    member_report_ids: Vec<Uuid>,
    version: i64,
    created_at: DateTime<Utc>,
}

impl ClusterRow {
    fn into_cluster(self) -> StoreResult<Cluster> {
        Ok(Cluster {
            id: self.id,
            centroid: GeoPoint::new(self.centroid_lat, self.centroid_lng),
            issue_type: self.issue_type.parse().map_err(StoreError::InvalidRow)?,
            title: self.title,
            report_count: u32::try_from(self.report_count)
                .map_err(|_| StoreError::InvalidRow(format!("report_count {}", self.report_count)))?,
            total_severity_score: u32::try_from(self.total_severity_score).map_err(|_| {
                StoreError::InvalidRow(format!("total_severity_score {}", self.total_severity_score))
            })?,
            average_severity: self.average_severity,
            priority_score: self.priority_score,
            status: self
                .status
                .parse::<ClusterStatus>()
                .map_err(StoreError::InvalidRow)?,
            last_activity: self.last_activity,
            member_report_ids: self.member_report_ids,
            version: self.version,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReportRow {
    id: Uuid,
    lat: f64,
    lng: f64,
    issue_type: String,
    severity: i16,
    description: Option<String>,
    image_ref: Option<String>,
    status: String,
    cluster_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl ReportRow {
    fn into_report(self) -> StoreResult<Report> {
        Ok(Report {
            id: self.id,
            location: GeoPoint::new(self.lat, self.lng),
            issue_type: self.issue_type.parse().map_err(StoreError::InvalidRow)?,
            severity: u8::try_from(self.severity)
                .map_err(|_| StoreError::InvalidRow(format!("severity {}", self.severity)))?,
            description: self.description,
            image_ref: self.image_ref,
            status: self
                .status
                .parse::<ReportStatus>()
                .map_err(StoreError::InvalidRow)?,
            cluster_id: self.cluster_id,
            created_at: self.created_at,
        })
    }
}
