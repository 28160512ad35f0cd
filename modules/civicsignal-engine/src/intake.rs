use civicsignal_common::error::Result;
use civicsignal_common::{CivicSignalError, IssueType, NewReport, RawReport};

pub const MIN_SEVERITY: i64 = 1;
pub const MAX_SEVERITY: i64 = 5;

/// Check a raw submission and turn it into a storable report.
/// Nothing is written here; rejected input never reaches the store.
pub fn validate_report(raw: RawReport) -> Result<NewReport> {
    let location = raw
        .location
        .ok_or_else(|| CivicSignalError::Validation("location is required".into()))?;
    if !location.is_valid() {
        return Err(CivicSignalError::Validation(format!(
            "location out of range: lat={}, lng={}",
            location.lat, location.lng
        )));
    }

    let issue_type = raw
        .issue_type
        .as_deref()
        .ok_or_else(|| CivicSignalError::Validation("issueType is required".into()))?
        .parse::<IssueType>()
        .map_err(CivicSignalError::Validation)?;

    let severity = raw
        .severity
        .ok_or_else(|| CivicSignalError::Validation("severity is required".into()))?;
    if !(MIN_SEVERITY..=MAX_SEVERITY).contains(&severity) {
        return Err(CivicSignalError::Validation(format!(
            "severity must be between {MIN_SEVERITY} and {MAX_SEVERITY}, got {severity}"
        )));
    }
    let severity = u8::try_from(severity)
        .map_err(|_| CivicSignalError::Validation(format!("invalid severity {severity}")))?;

    Ok(NewReport {
        location,
        issue_type,
        severity,
        description: non_blank(raw.description),
        image_ref: non_blank(raw.image_ref),
    })
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
