use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::discovery::{FileCatalog, KnownFile, MediaFile};
use crate::error::ScanError;
use crate::models::{CategoryConfig, FileStatus, ModelStatusRow, ScanResult, SeverityBands};

pub const MODEL_VERSION: &str = "v1.0";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let categories = vec![
        (
            "hate_speech",
            "Hate Speech",
            "Slurs, dehumanising or discriminatory language",
            0.5,
            serde_json::json!({"mild": 0.3, "moderate": 0.6, "severe": 0.8}),
        ),
        (
            "violence",
            "Violence",
            "Threats, descriptions of physical harm",
            0.5,
            serde_json::json!({"mild": 0.3, "moderate": 0.6, "severe": 0.8}),
        ),
        (
            "sexual_assault",
            "Sexual Assault",
            "References to sexual violence",
            0.4,
            serde_json::json!({"mild": 0.25, "moderate": 0.5, "severe": 0.75}),
        ),
        (
            "self_harm",
            "Self Harm",
            "Suicide and self-injury",
            0.4,
            serde_json::json!({"mild": 0.25, "moderate": 0.5, "severe": 0.75}),
        ),
        (
            "substance_abuse",
            "Substance Abuse",
            "Drug and alcohol misuse",
            0.6,
            serde_json::json!({"mild": 0.4, "moderate": 0.65, "severe": 0.85}),
        ),
    ];

    for (name, display_name, description, threshold, bands) in categories {
        sqlx::query(
            r#"
            INSERT INTO model_categories
            (category_name, display_name, description, default_threshold, severity_mapping, is_active)
            VALUES ($1, $2, $3, $4, $5, true)
            ON CONFLICT (category_name) DO UPDATE
            SET display_name = EXCLUDED.display_name, description = EXCLUDED.description
            "#,
        )
        .bind(name)
        .bind(display_name)
        .bind(description)
        .bind(threshold)
        .bind(bands)
        .execute(pool)
        .await?;
    }

    let models = vec![
        (
            "toxic-bert",
            "unitary/toxic-bert",
            vec!["hate_speech", "violence"],
            1.0,
            serde_json::json!({}),
        ),
        (
            "sentiment-fallback",
            "distilbert-base-uncased-finetuned-sst-2-english",
            vec!["violence", "self_harm"],
            0.5,
            serde_json::json!({"threshold": 0.45}),
        ),
    ];

    for (name, hf_id, categories, weight, config) in models {
        sqlx::query(
            r#"
            INSERT INTO nlp_models
            (name, huggingface_id, task_type, categories, weight, model_config, status, is_active)
            VALUES ($1, $2, 'text-classification', $3, $4, $5, 'pending', true)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(hf_id)
        .bind(categories)
        .bind(weight)
        .bind(config)
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn load_categories(pool: &PgPool) -> Result<Vec<CategoryConfig>, ScanError> {
    let rows = sqlx::query(
        "SELECT category_name, default_threshold, severity_mapping \
         FROM model_categories WHERE is_active = true",
    )
    .fetch_all(pool)
    .await?;

    let mut categories = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.get("category_name");
        let mapping: Option<serde_json::Value> = row.get("severity_mapping");
        let bands = match mapping {
            Some(value) if !value.is_null() => serde_json::from_value::<SeverityBands>(value)
                .unwrap_or_else(|err| {
                    warn!(category = %name, error = %err, "invalid severity mapping, using defaults");
                    SeverityBands::default()
                }),
            _ => SeverityBands::default(),
        };

        categories.push(CategoryConfig {
            name,
            threshold: row.get("default_threshold"),
            bands,
        });
    }

    Ok(categories)
}

/// Registry row before its JSON config has been validated.
#[derive(Debug, Clone)]
pub struct ModelRow {
    pub id: i64,
    pub name: String,
    pub huggingface_id: String,
    pub task_type: String,
    pub categories: Vec<String>,
    pub weight: f64,
    pub model_config: Option<serde_json::Value>,
}

pub async fn load_model_rows(pool: &PgPool) -> Result<Vec<ModelRow>, ScanError> {
    let rows = sqlx::query(
        "SELECT id, name, huggingface_id, task_type, categories, weight, model_config \
         FROM nlp_models \
         WHERE is_active = true AND status IN ('pending', 'ready') \
         ORDER BY weight DESC, id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ModelRow {
            id: row.get("id"),
            name: row.get("name"),
            huggingface_id: row.get("huggingface_id"),
            task_type: row.get("task_type"),
            categories: row.get("categories"),
            weight: row.get("weight"),
            model_config: row.get("model_config"),
        })
        .collect())
}

pub async fn update_model_status(
    pool: &PgPool,
    model_id: i64,
    status: &str,
    error_message: Option<&str>,
) -> Result<(), ScanError> {
    sqlx::query(
        "UPDATE nlp_models SET status = $1, error_message = $2, updated_at = now() WHERE id = $3",
    )
    .bind(status)
    .bind(error_message)
    .bind(model_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_models(pool: &PgPool) -> anyhow::Result<Vec<ModelStatusRow>> {
    let rows = sqlx::query(
        "SELECT id, name, huggingface_id, task_type, categories, weight, status, \
         error_message, is_custom \
         FROM nlp_models WHERE is_active = true \
         ORDER BY weight DESC, created_at DESC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list models")?;

    Ok(rows
        .into_iter()
        .map(|row| ModelStatusRow {
            id: row.get("id"),
            name: row.get("name"),
            huggingface_id: row.get("huggingface_id"),
            task_type: row.get("task_type"),
            categories: row.get("categories"),
            weight: row.get("weight"),
            status: row.get("status"),
            error_message: row.get("error_message"),
            is_custom: row.get("is_custom"),
        })
        .collect())
}

pub struct NewModel {
    pub name: String,
    pub huggingface_id: String,
    pub task_type: String,
    pub categories: Vec<String>,
    pub weight: f64,
    pub config: serde_json::Value,
}

/// Register a custom model; workers pick it up on their next context load.
pub async fn add_model(pool: &PgPool, model: &NewModel) -> anyhow::Result<i64> {
    let id: i64 = sqlx::query(
        r#"
        INSERT INTO nlp_models
        (name, huggingface_id, task_type, categories, weight, is_custom, model_config, status, is_active)
        VALUES ($1, $2, $3, $4, $5, true, $6, 'pending', true)
        RETURNING id
        "#,
    )
    .bind(&model.name)
    .bind(&model.huggingface_id)
    .bind(&model.task_type)
    .bind(&model.categories)
    .bind(model.weight)
    .bind(&model.config)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to add model {}", model.name))?
    .get("id");
    Ok(id)
}

pub async fn deactivate_model(pool: &PgPool, model_id: i64) -> anyhow::Result<bool> {
    let result = sqlx::query(
        "UPDATE nlp_models SET is_active = false, updated_at = now() WHERE id = $1",
    )
    .bind(model_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Upsert a `files` row so a queued job has something to report against.
pub async fn register_file(pool: &PgPool, path: &str) -> anyhow::Result<i64> {
    let file = std::path::Path::new(path);
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string());
    let file_type = file
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());

    let id: i64 = sqlx::query(
        r#"
        INSERT INTO files (path, filename, file_type, scan_status)
        VALUES ($1, $2, $3, 'pending')
        ON CONFLICT (path) DO UPDATE SET scan_status = 'pending'
        RETURNING id
        "#,
    )
    .bind(path)
    .bind(filename)
    .bind(file_type)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

/// Durable state the worker reads and writes while processing a job.
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn set_file_status(&self, file_path: &str, status: FileStatus) -> Result<(), ScanError>;

    async fn file_id(&self, file_path: &str) -> Result<Option<i64>, ScanError>;

    /// Insert the summary row and every trigger row atomically.
    async fn store_scan_result(
        &self,
        result: &ScanResult,
        metadata: serde_json::Value,
    ) -> Result<i64, ScanError>;

    async fn close(&self);
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScanStore for PgStore {
    async fn set_file_status(&self, file_path: &str, status: FileStatus) -> Result<(), ScanError> {
        sqlx::query("UPDATE files SET scan_status = $1, last_scanned = $2 WHERE path = $3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn file_id(&self, file_path: &str) -> Result<Option<i64>, ScanError> {
        let row = sqlx::query("SELECT id FROM files WHERE path = $1")
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("id")))
    }

    async fn store_scan_result(
        &self,
        result: &ScanResult,
        metadata: serde_json::Value,
    ) -> Result<i64, ScanError> {
        let file_id = result
            .file_id
            .ok_or_else(|| ScanError::Persistence("scan result has no file id".to_string()))?;
        let total_triggers = i32::try_from(result.total_triggers)
            .map_err(|_| ScanError::Persistence("trigger count out of range".to_string()))?;

        // Dropping the transaction without commit rolls everything back.
        let mut tx = self.pool.begin().await?;

        let scan_result_id: i64 = sqlx::query(
            r#"
            INSERT INTO scan_results
            (file_id, model_version, processing_time_ms, overall_risk_score,
             highest_severity, total_triggers, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(file_id)
        .bind(MODEL_VERSION)
        .bind(result.processing_time_ms)
        .bind(result.overall_risk_score)
        .bind(result.highest_severity.as_str())
        .bind(total_triggers)
        .bind(metadata)
        .fetch_one(&mut *tx)
        .await?
        .get("id");

        for hit in &result.triggers {
            sqlx::query(
                r#"
                INSERT INTO triggers
                (scan_result_id, category, severity, score, confidence_score, model_name,
                 timestamp_start, timestamp_end, subtitle_text, context_before, context_after)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(scan_result_id)
            .bind(&hit.trigger.category)
            .bind(hit.trigger.severity.as_str())
            .bind(hit.trigger.score)
            .bind(hit.trigger.confidence)
            .bind(&hit.trigger.model_name)
            .bind(&hit.start_time)
            .bind(&hit.end_time)
            .bind(&hit.subtitle_text)
            .bind(&hit.context_before)
            .bind(&hit.context_after)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(scan_result_id, triggers = result.total_triggers, "stored scan result");
        Ok(scan_result_id)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl FileCatalog for PgStore {
    async fn known_file(&self, path: &str) -> Result<Option<KnownFile>, ScanError> {
        let row = sqlx::query("SELECT last_modified, last_scanned FROM files WHERE path = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| KnownFile {
            last_modified: row.get("last_modified"),
            last_scanned: row.get("last_scanned"),
        }))
    }

    async fn upsert_discovered(&self, file: &MediaFile, hash: &str) -> Result<i64, ScanError> {
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO files
            (path, filename, file_type, file_size, file_hash, last_modified, scan_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (path) DO UPDATE
            SET filename = EXCLUDED.filename,
                file_type = EXCLUDED.file_type,
                file_size = EXCLUDED.file_size,
                file_hash = EXCLUDED.file_hash,
                last_modified = EXCLUDED.last_modified,
                scan_status = EXCLUDED.scan_status
            RETURNING id
            "#,
        )
        .bind(&file.path)
        .bind(&file.filename)
        .bind(&file.file_type)
        .bind(file.size)
        .bind(hash)
        .bind(file.modified)
        .bind(FileStatus::Queued.as_str())
        .fetch_one(&self.pool)
        .await?
        .get("id");
        Ok(id)
    }
}
