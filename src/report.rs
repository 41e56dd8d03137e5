use std::collections::HashMap;
use std::fmt::Write;

use crate::models::{ScanResult, Severity, TimedTrigger};

#[derive(Debug, Clone)]
pub struct CategorySummary {
    pub category: String,
    pub count: usize,
    pub avg_confidence: f64,
    pub worst: Severity,
}

pub fn summarize_by_category(triggers: &[TimedTrigger]) -> Vec<CategorySummary> {
    let mut map: HashMap<String, (usize, f64, Severity)> = HashMap::new();

    for hit in triggers {
        let entry = map
            .entry(hit.trigger.category.clone())
            .or_insert((0, 0.0, Severity::None));
        entry.0 += 1;
        entry.1 += hit.trigger.confidence;
        entry.2 = entry.2.max(hit.trigger.severity);
    }

    let mut summaries: Vec<CategorySummary> = map
        .into_iter()
        .map(|(category, (count, total_confidence, worst))| CategorySummary {
            category,
            count,
            avg_confidence: if count == 0 {
                0.0
            } else {
                total_confidence / count as f64
            },
            worst,
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.category.cmp(&b.category)));
    summaries
}

pub fn build_report(file_path: &str, result: &ScanResult) -> String {
    let summaries = summarize_by_category(&result.triggers);

    let mut output = String::new();
    let _ = writeln!(output, "# Content Warning Report");
    let _ = writeln!(output, "Generated for {file_path}");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(output, "- Overall risk: {:.2}", result.overall_risk_score);
    let _ = writeln!(output, "- Highest severity: {}", result.highest_severity);
    let _ = writeln!(output, "- Triggers: {}", result.total_triggers);
    let _ = writeln!(output, "- Processing time: {} ms", result.processing_time_ms);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Category Mix");
    if summaries.is_empty() {
        let _ = writeln!(output, "No triggers detected.");
    } else {
        for summary in &summaries {
            let _ = writeln!(
                output,
                "- {}: {} triggers (worst {}, avg confidence {:.2})",
                summary.category, summary.count, summary.worst, summary.avg_confidence
            );
        }
    }

    let mut worst_first: Vec<&TimedTrigger> = result.triggers.iter().collect();
    worst_first.sort_by(|a, b| {
        b.trigger
            .severity
            .cmp(&a.trigger.severity)
            .then_with(|| {
                b.trigger
                    .score
                    .partial_cmp(&a.trigger.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Severity Moments");
    if worst_first.is_empty() {
        let _ = writeln!(output, "No triggers detected.");
    } else {
        for hit in worst_first.iter().take(5) {
            let _ = writeln!(
                output,
                "- [{} - {}] {} ({}, score {:.2}, via {}): {}",
                hit.start_time,
                hit.end_time,
                hit.trigger.category,
                hit.trigger.severity,
                hit.trigger.score,
                hit.trigger.model_name,
                hit.subtitle_text
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Timeline");
    if result.triggers.is_empty() {
        let _ = writeln!(output, "No triggers detected.");
    } else {
        for hit in result.triggers.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} {} ({})",
                hit.start_time, hit.trigger.category, hit.trigger.severity
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Trigger;
    use crate::risk;

    fn hit(category: &str, severity: Severity, score: f64, start: &str) -> TimedTrigger {
        TimedTrigger {
            trigger: Trigger {
                category: category.to_string(),
                severity,
                score,
                confidence: score,
                model_name: "toxic-bert".to_string(),
                segment: 1,
            },
            start_time: start.to_string(),
            end_time: start.to_string(),
            subtitle_text: "line".to_string(),
            context_before: String::new(),
            context_after: String::new(),
        }
    }

    #[test]
    fn categories_are_counted_and_ranked() {
        let triggers = vec![
            hit("violence", Severity::Mild, 0.4, "00:00:01.000"),
            hit("hate_speech", Severity::Severe, 0.9, "00:00:02.000"),
            hit("violence", Severity::Moderate, 0.6, "00:00:03.000"),
        ];
        let summaries = summarize_by_category(&triggers);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].category, "violence");
        assert_eq!(summaries[0].count, 2);
        assert_eq!(summaries[0].worst, Severity::Moderate);
        assert!((summaries[0].avg_confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn report_lists_worst_moment_first() {
        let result = risk::summarize(
            Some(1),
            30,
            vec![
                hit("violence", Severity::Mild, 0.4, "00:00:01.000"),
                hit("hate_speech", Severity::Severe, 0.9, "00:00:02.000"),
            ],
        );
        let report = build_report("/media/film.srt", &result);

        assert!(report.contains("Generated for /media/film.srt"));
        assert!(report.contains("- Highest severity: severe"));
        let moments = report.split("## Highest Severity Moments").nth(1).unwrap();
        let first = moments.lines().nth(1).unwrap();
        assert!(first.contains("hate_speech"));
    }

    #[test]
    fn empty_result_renders_placeholders() {
        let report = build_report("a.srt", &risk::summarize(None, 0, Vec::new()));
        assert!(report.contains("No triggers detected."));
        assert!(report.contains("- Overall risk: 0.00"));
    }
}
