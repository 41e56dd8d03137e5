use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One timestamped unit of subtitle text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub index: usize,
    /// `HH:MM:SS.mmm`
    pub start: String,
    pub end: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Mild,
    Moderate,
    Severe,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Mild => "mild",
            Severity::Moderate => "moderate",
            Severity::Severe => "severe",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower bounds of each severity band, compared highest-first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityBands {
    #[serde(default = "default_mild")]
    pub mild: f64,
    #[serde(default = "default_moderate")]
    pub moderate: f64,
    #[serde(default = "default_severe")]
    pub severe: f64,
}

fn default_mild() -> f64 {
    0.3
}

fn default_moderate() -> f64 {
    0.6
}

fn default_severe() -> f64 {
    0.8
}

impl Default for SeverityBands {
    fn default() -> Self {
        Self {
            mild: default_mild(),
            moderate: default_moderate(),
            severe: default_severe(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryConfig {
    pub name: String,
    pub threshold: f64,
    pub bands: SeverityBands,
}

/// Per-model overrides stored as JSON in the model registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub label_mappings: HashMap<String, Vec<String>>,
}

/// A classification model as registered in `nlp_models`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub id: i64,
    pub name: String,
    pub huggingface_id: String,
    pub task_type: String,
    pub categories: Vec<String>,
    pub weight: f64,
    pub config: ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f64,
}

/// Raw labels one model produced for one piece of text.
#[derive(Debug, Clone)]
pub struct ModelOutput<'a> {
    pub model: &'a ModelDescriptor,
    pub labels: Vec<LabelScore>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub score: f64,
    pub model_name: String,
    pub model_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trigger {
    pub category: String,
    pub severity: Severity,
    pub score: f64,
    pub confidence: f64,
    pub model_name: String,
    /// Index of the segment this trigger was found in.
    pub segment: usize,
}

/// A trigger placed on the file timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimedTrigger {
    #[serde(flatten)]
    pub trigger: Trigger,
    pub start_time: String,
    pub end_time: String,
    pub subtitle_text: String,
    pub context_before: String,
    pub context_after: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ScanJob {
    pub fn new(file_path: impl Into<String>) -> Self {
        let file_path = file_path.into();
        let file_type = std::path::Path::new(&file_path)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_path,
            file_type,
            priority: 0,
            created_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanResult {
    pub file_id: Option<i64>,
    pub processing_time_ms: i64,
    pub overall_risk_score: f64,
    pub highest_severity: Severity,
    pub total_triggers: usize,
    pub triggers: Vec<TimedTrigger>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Queued => "queued",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Error => "error",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ModelStatusRow {
    pub id: i64,
    pub name: String,
    pub huggingface_id: String,
    pub task_type: String,
    pub categories: Vec<String>,
    pub weight: f64,
    pub status: String,
    pub error_message: Option<String>,
    pub is_custom: bool,
}
