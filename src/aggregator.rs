use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::context::AnalysisContext;
use crate::inference::Classifier;
use crate::models::{
    ModelDescriptor, ModelOutput, RawDetection, Segment, Severity, SeverityBands, Trigger,
};

/// Longest text, in characters, handed to a model.
pub const MAX_MODEL_INPUT: usize = 512;

const BASE_LABEL_MAP: &[(&str, &[&str])] = &[
    ("TOXIC", &["hate_speech", "violence"]),
    ("SEVERE_TOXIC", &["hate_speech", "violence"]),
    ("TOXICITY", &["hate_speech", "violence"]),
    ("OBSCENE", &["hate_speech"]),
    ("INSULT", &["hate_speech"]),
    ("THREAT", &["violence"]),
    ("NSFW", &["sexual_assault"]),
];

/// Canonical categories for a model label. Per-model mappings win over the
/// base table; `NEGATIVE` fans out to the model's own categories.
pub fn map_label(label: &str, model: &ModelDescriptor) -> Vec<String> {
    let label = label.to_uppercase();
    if let Some(categories) = model.config.label_mappings.get(&label) {
        return categories.clone();
    }

    match label.as_str() {
        "NEGATIVE" => model.categories.clone(),
        "POSITIVE" => Vec::new(),
        other => BASE_LABEL_MAP
            .iter()
            .find(|(name, _)| *name == other)
            .map(|(_, categories)| categories.iter().map(|c| c.to_string()).collect())
            .unwrap_or_default(),
    }
}

/// Band a weighted score. Categories without configured bands use the fixed
/// fallback, which never yields `None`.
pub fn severity_for(score: f64, bands: Option<&SeverityBands>) -> Severity {
    match bands {
        Some(bands) => {
            if score >= bands.severe {
                Severity::Severe
            } else if score >= bands.moderate {
                Severity::Moderate
            } else if score >= bands.mild {
                Severity::Mild
            } else {
                Severity::None
            }
        }
        None => {
            if score <= 0.3 {
                Severity::Mild
            } else if score <= 0.6 {
                Severity::Moderate
            } else {
                Severity::Severe
            }
        }
    }
}

pub fn model_input(context_before: &str, text: &str, context_after: &str) -> String {
    let joined = format!("{context_before} {text} {context_after}");
    let joined = joined.trim();
    match joined.char_indices().nth(MAX_MODEL_INPUT) {
        Some((cut, _)) => joined[..cut].to_string(),
        None => joined.to_string(),
    }
}

fn detect(
    ctx: &AnalysisContext,
    model: &ModelDescriptor,
    detection: &RawDetection,
    segment: usize,
) -> Vec<Trigger> {
    let adjusted = detection.score * detection.model_weight;

    map_label(&detection.label, model)
        .into_iter()
        .filter_map(|category| {
            let config = ctx.category(&category);
            let Some(threshold) = model.config.threshold.or(config.map(|c| c.threshold)) else {
                debug!(%category, model = %model.name, "no threshold for category");
                return None;
            };
            if adjusted < threshold {
                return None;
            }

            let severity = severity_for(adjusted, config.map(|c| &c.bands));
            if severity == Severity::None {
                return None;
            }

            Some(Trigger {
                category,
                severity,
                score: adjusted,
                confidence: adjusted.min(1.0),
                model_name: detection.model_name.clone(),
                segment,
            })
        })
        .collect()
}

/// Combine two triggers for the same category. Both sides count equally in
/// the score average, whatever weight produced them.
pub fn merge(existing: Trigger, incoming: Trigger) -> Trigger {
    let (existing_weight, incoming_weight) = (1.0, 1.0);
    Trigger {
        severity: existing.severity.max(incoming.severity),
        score: (existing.score * existing_weight + incoming.score * incoming_weight)
            / (existing_weight + incoming_weight),
        confidence: existing.confidence.max(incoming.confidence),
        model_name: format!("{}, {}", existing.model_name, incoming.model_name),
        ..existing
    }
}

/// Fold every model's output for one segment into at most one trigger per
/// category. Output is ordered by category name.
pub fn aggregate(
    ctx: &AnalysisContext,
    segment: usize,
    outputs: &[ModelOutput<'_>],
) -> Vec<Trigger> {
    outputs
        .iter()
        .flat_map(|output| {
            output.labels.iter().map(move |label| {
                (
                    output.model,
                    RawDetection {
                        label: label.label.clone(),
                        score: label.score,
                        model_name: output.model.name.clone(),
                        model_weight: output.model.weight,
                    },
                )
            })
        })
        .flat_map(|(model, detection)| detect(ctx, model, &detection, segment))
        .fold(BTreeMap::<String, Trigger>::new(), |mut acc, trigger| {
            let merged = match acc.remove(&trigger.category) {
                Some(existing) => merge(existing, trigger),
                None => trigger,
            };
            acc.insert(merged.category.clone(), merged);
            acc
        })
        .into_values()
        .collect()
}

/// Run every loaded model on the text; a failing model is left out.
pub async fn collect_outputs<'a>(
    ctx: &'a AnalysisContext,
    classifier: &dyn Classifier,
    text: &str,
) -> Vec<ModelOutput<'a>> {
    let mut outputs = Vec::with_capacity(ctx.models().len());
    for model in ctx.models() {
        match classifier.classify(model, text).await {
            Ok(labels) => outputs.push(ModelOutput { model, labels }),
            Err(err) => warn!(model = %model.name, error = %err, "model failed, skipping"),
        }
    }
    outputs
}

/// Analyze one segment with its neighbours as context.
pub async fn analyze(
    ctx: &AnalysisContext,
    classifier: &dyn Classifier,
    segment: &Segment,
    context_before: &str,
    context_after: &str,
) -> Vec<Trigger> {
    if ctx.models().is_empty() {
        warn!(state = ?ctx.state(), "no models loaded for analysis");
        return Vec::new();
    }

    let input = model_input(context_before, &segment.text, context_after);
    let outputs = collect_outputs(ctx, classifier, &input).await;
    aggregate(ctx, segment.index, &outputs)
}
