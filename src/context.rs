use std::collections::HashMap;

use sqlx::PgPool;
use tracing::{info, warn};

use crate::db::{self, ModelRow};
use crate::error::ScanError;
use crate::models::{CategoryConfig, ModelConfig, ModelDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Ready,
    Disposed,
}

/// Categories and models loaded for one analysis run. Read-only once ready.
#[derive(Debug)]
pub struct AnalysisContext {
    state: ContextState,
    categories: HashMap<String, CategoryConfig>,
    models: Vec<ModelDescriptor>,
}

impl AnalysisContext {
    pub fn new() -> Self {
        Self {
            state: ContextState::Created,
            categories: HashMap::new(),
            models: Vec::new(),
        }
    }

    /// Build a ready context from already-resolved parts.
    pub fn with_parts(categories: Vec<CategoryConfig>, models: Vec<ModelDescriptor>) -> Self {
        Self {
            state: ContextState::Ready,
            categories: categories
                .into_iter()
                .map(|category| (category.name.clone(), category))
                .collect(),
            models,
        }
    }

    /// Load active categories and models from the registry tables.
    pub async fn load(&mut self, pool: &PgPool) -> Result<(), ScanError> {
        if self.state != ContextState::Created {
            return Err(ScanError::Config(format!(
                "analysis context cannot be loaded from state {:?}",
                self.state
            )));
        }

        let categories = db::load_categories(pool).await?;
        info!(count = categories.len(), "loaded trigger categories");

        let mut models = Vec::new();
        for row in db::load_model_rows(pool).await? {
            let id = row.id;
            let name = row.name.clone();
            match resolve_model(row) {
                Ok(model) => {
                    db::update_model_status(pool, id, "ready", None).await?;
                    models.push(model);
                }
                Err(message) => {
                    warn!(model = %name, %message, "model rejected");
                    db::update_model_status(pool, id, "error", Some(&message)).await?;
                }
            }
        }
        info!(count = models.len(), "loaded models");

        *self = Self::with_parts(categories, models);
        Ok(())
    }

    pub fn dispose(&mut self) {
        self.models.clear();
        self.categories.clear();
        self.state = ContextState::Disposed;
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Models in loading order; empty unless the context is ready.
    pub fn models(&self) -> &[ModelDescriptor] {
        match self.state {
            ContextState::Ready => &self.models,
            _ => &[],
        }
    }

    pub fn category(&self, name: &str) -> Option<&CategoryConfig> {
        self.categories.get(name)
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models().iter().map(|model| model.name.clone()).collect()
    }
}

impl Default for AnalysisContext {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_model(row: ModelRow) -> Result<ModelDescriptor, String> {
    if row.weight.is_nan() || row.weight <= 0.0 {
        return Err(format!("weight must be positive, got {}", row.weight));
    }

    let mut config: ModelConfig = match row.model_config {
        Some(value) if !value.is_null() => {
            serde_json::from_value(value).map_err(|err| format!("invalid model_config: {err}"))?
        }
        _ => ModelConfig::default(),
    };

    if let Some(threshold) = config.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(format!("threshold must be within [0, 1], got {threshold}"));
        }
    }

    config.label_mappings = config
        .label_mappings
        .into_iter()
        .map(|(label, categories)| (label.to_uppercase(), categories))
        .collect();

    Ok(ModelDescriptor {
        id: row.id,
        name: row.name,
        huggingface_id: row.huggingface_id,
        task_type: row.task_type,
        categories: row.categories,
        weight: row.weight,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SeverityBands;
    use serde_json::json;

    fn row(weight: f64, config: Option<serde_json::Value>) -> ModelRow {
        ModelRow {
            id: 7,
            name: "toxic-bert".to_string(),
            huggingface_id: "unitary/toxic-bert".to_string(),
            task_type: "text-classification".to_string(),
            categories: vec!["hate_speech".to_string()],
            weight,
            model_config: config,
        }
    }

    #[test]
    fn lifecycle_moves_from_ready_to_disposed() {
        let fresh = AnalysisContext::new();
        assert_eq!(fresh.state(), ContextState::Created);
        assert!(fresh.models().is_empty());

        let model = resolve_model(row(1.0, None)).unwrap();
        let mut ctx = AnalysisContext::with_parts(
            vec![CategoryConfig {
                name: "violence".to_string(),
                threshold: 0.5,
                bands: SeverityBands::default(),
            }],
            vec![model],
        );
        assert_eq!(ctx.state(), ContextState::Ready);
        assert_eq!(ctx.model_names(), vec!["toxic-bert".to_string()]);
        assert!(ctx.category("violence").is_some());

        ctx.dispose();
        assert_eq!(ctx.state(), ContextState::Disposed);
        assert!(ctx.models().is_empty());
        assert!(ctx.category("violence").is_none());
    }

    #[test]
    fn model_config_labels_are_upper_cased() {
        let model = resolve_model(row(
            0.8,
            Some(json!({"threshold": 0.4, "label_mappings": {"label_1": ["violence"]}})),
        ))
        .unwrap();
        assert_eq!(model.config.threshold, Some(0.4));
        assert_eq!(
            model.config.label_mappings.get("LABEL_1"),
            Some(&vec!["violence".to_string()])
        );
    }

    #[test]
    fn invalid_models_are_rejected() {
        assert!(resolve_model(row(0.0, None)).is_err());
        assert!(resolve_model(row(-2.0, None)).is_err());
        assert!(resolve_model(row(f64::NAN, None)).is_err());
        assert!(resolve_model(row(1.0, Some(json!({"threshold": 1.5})))).is_err());
        assert!(resolve_model(row(1.0, Some(json!({"label_mappings": "nope"})))).is_err());
    }
}
