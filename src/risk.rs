use crate::models::{ScanResult, Severity, TimedTrigger};

/// Confidence-weighted mean of trigger scores, clamped to `[0, 1]`.
pub fn overall_risk_score(triggers: &[TimedTrigger]) -> f64 {
    let (weighted, total_confidence) = triggers.iter().fold((0.0, 0.0), |(sum, weight), hit| {
        (
            sum + hit.trigger.score * hit.trigger.confidence,
            weight + hit.trigger.confidence,
        )
    });

    if total_confidence > 0.0 {
        (weighted / total_confidence).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn highest_severity(triggers: &[TimedTrigger]) -> Severity {
    triggers
        .iter()
        .map(|hit| hit.trigger.severity)
        .max()
        .unwrap_or(Severity::None)
}

pub fn summarize(
    file_id: Option<i64>,
    processing_time_ms: i64,
    triggers: Vec<TimedTrigger>,
) -> ScanResult {
    ScanResult {
        file_id,
        processing_time_ms,
        overall_risk_score: overall_risk_score(&triggers),
        highest_severity: highest_severity(&triggers),
        total_triggers: triggers.len(),
        triggers,
    }
}
