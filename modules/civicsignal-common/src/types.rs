use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::haversine_distance_meters;

// --- Geo Types ---

/// A WGS84 point. Serialized as a GeoJSON `Point` (`coordinates: [lng, lat]`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "GeoJsonPoint", from = "GeoJsonPoint")]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_meters(&self, other: &GeoPoint) -> f64 {
        haversine_distance_meters(self.lat, self.lng, other.lat, other.lng)
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeoJsonPoint {
    #[serde(rename = "type", default = "point_kind")]
    kind: String,
    coordinates: [f64; 2],
}

fn point_kind() -> String {
    "Point".to_string()
}

impl From<GeoPoint> for GeoJsonPoint {
    fn from(p: GeoPoint) -> Self {
        Self {
            kind: point_kind(),
            coordinates: [p.lng, p.lat],
        }
    }
}

impl From<GeoJsonPoint> for GeoPoint {
    fn from(p: GeoJsonPoint) -> Self {
        Self {
            lng: p.coordinates[0],
            lat: p.coordinates[1],
        }
    }
}

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Pothole,
    Garbage,
    Light,
    Safety,
    Water,
    Traffic,
    Noise,
}

impl IssueType {
    pub const ALL: [IssueType; 7] = [
        IssueType::Pothole,
        IssueType::Garbage,
        IssueType::Light,
        IssueType::Safety,
        IssueType::Water,
        IssueType::Traffic,
        IssueType::Noise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Pothole => "pothole",
            IssueType::Garbage => "garbage",
            IssueType::Light => "light",
            IssueType::Safety => "safety",
            IssueType::Water => "water",
            IssueType::Traffic => "traffic",
            IssueType::Noise => "noise",
        }
    }

    /// Display title for a cluster of this issue type, e.g. "Pothole Issue".
    pub fn cluster_title(&self) -> String {
        let name = self.as_str();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => format!("{}{} Issue", first.to_uppercase(), chars.as_str()),
            None => "Issue".to_string(),
        }
    }
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IssueType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unrecognized issue type: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    New,
    Clustered,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::New => "new",
            ReportStatus::Clustered => "clustered",
        }
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ReportStatus::New),
            "clustered" => Ok(ReportStatus::Clustered),
            other => Err(format!("unrecognized report status: {other}")),
        }
    }
}

/// Cluster lifecycle. Only ever moves forward; `Resolved` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterStatus {
    Reported,
    Acknowledged,
    InProgress,
    Resolved,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Reported => "reported",
            ClusterStatus::Acknowledged => "acknowledged",
            ClusterStatus::InProgress => "in-progress",
            ClusterStatus::Resolved => "resolved",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ClusterStatus::Reported => 0,
            ClusterStatus::Acknowledged => 1,
            ClusterStatus::InProgress => 2,
            ClusterStatus::Resolved => 3,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only lifecycle.
    /// Staying in place counts as allowed.
    pub fn can_advance_to(&self, next: ClusterStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reported" => Ok(ClusterStatus::Reported),
            "acknowledged" => Ok(ClusterStatus::Acknowledged),
            "in-progress" => Ok(ClusterStatus::InProgress),
            "resolved" => Ok(ClusterStatus::Resolved),
            other => Err(format!("unrecognized cluster status: {other}")),
        }
    }
}

/// Which side of the lifecycle a listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    Active,
    Resolved,
}

impl StatusFilter {
    /// `"resolved"` selects resolved clusters; anything else (or nothing) selects active ones.
    pub fn from_query(status: Option<&str>) -> Self {
        match status {
            Some("resolved") => StatusFilter::Resolved,
            _ => StatusFilter::Active,
        }
    }

    pub fn matches(&self, status: ClusterStatus) -> bool {
        match self {
            StatusFilter::Active => status != ClusterStatus::Resolved,
            StatusFilter::Resolved => status == ClusterStatus::Resolved,
        }
    }
}

// --- Reports ---

/// Unvalidated report as received from a client. Every field is optional so
/// that missing input can be reported as a validation failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReport {
    pub location: Option<GeoPoint>,
    pub issue_type: Option<String>,
    pub severity: Option<i64>,
    pub description: Option<String>,
    #[serde(alias = "imageUrl")]
    pub image_ref: Option<String>,
}

/// A validated report ready to be persisted. The store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReport {
    pub location: GeoPoint,
    pub issue_type: IssueType,
    pub severity: u8,
    pub description: Option<String>,
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: Uuid,
    pub location: GeoPoint,
    pub issue_type: IssueType,
    pub severity: u8,
    pub description: Option<String>,
    pub image_ref: Option<String>,
    pub status: ReportStatus,
    pub cluster_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Report {
    pub fn is_clustered(&self) -> bool {
        self.status == ReportStatus::Clustered
    }
}

// --- Clusters ---

/// A cluster before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCluster {
    pub centroid: GeoPoint,
    pub issue_type: IssueType,
    pub title: String,
    pub report_count: u32,
    pub total_severity_score: u32,
    pub average_severity: f64,
    pub priority_score: f64,
    pub status: ClusterStatus,
    pub last_activity: DateTime<Utc>,
    pub member_report_ids: Vec<Uuid>,
}

impl NewCluster {
    /// Materialize with store-assigned identity. New clusters start at version 1.
    pub fn into_cluster(self, id: Uuid, created_at: DateTime<Utc>) -> Cluster {
        Cluster {
            id,
            centroid: self.centroid,
            issue_type: self.issue_type,
            title: self.title,
            report_count: self.report_count,
            total_severity_score: self.total_severity_score,
            average_severity: self.average_severity,
            priority_score: self.priority_score,
            status: self.status,
            last_activity: self.last_activity,
            member_report_ids: self.member_report_ids,
            version: 1,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: Uuid,
    pub centroid: GeoPoint,
    pub issue_type: IssueType,
    pub title: String,
    pub report_count: u32,
    pub total_severity_score: u32,
    pub average_severity: f64,
    pub priority_score: f64,
    pub status: ClusterStatus,
    pub last_activity: DateTime<Utc>,
    pub member_report_ids: Vec<Uuid>,
    /// Optimistic concurrency token. Bumped by the store on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}
