pub const DEFAULT_WEIGHT_COUNT: f64 = 20.0;
pub const DEFAULT_WEIGHT_SEVERITY: f64 = 20.0;

/// Weights for the triage priority score:
/// `report_count * count + average_severity * severity`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityWeights {
    pub count: f64,
    pub severity: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            count: DEFAULT_WEIGHT_COUNT,
            severity: DEFAULT_WEIGHT_SEVERITY,
        }
    }
}

impl PriorityWeights {
    pub fn score(&self, report_count: u32, average_severity: f64) -> f64 {
        f64::from(report_count) * self.count + average_severity * self.severity
    }
}

/// Mean severity. Callers guarantee `report_count >= 1`.
pub fn average_severity(total_severity_score: u32, report_count: u32) -> f64 {
    f64::from(total_severity_score) / f64::from(report_count.max(1))
}
