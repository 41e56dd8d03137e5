use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ScanError;
use crate::models::{LabelScore, ModelDescriptor};

/// Runs one registered model over a piece of text.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, model: &ModelDescriptor, text: &str)
        -> Result<Vec<LabelScore>, ScanError>;
}

/// Client for a model-serving endpoint exposing `POST /classify`.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    model: &'a str,
    task: &'a str,
    text: &'a str,
}

impl HttpClassifier {
    pub fn new(base_url: &str) -> Result<Self, ScanError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| ScanError::Config(format!("inference client: {err}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/classify", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        model: &ModelDescriptor,
        text: &str,
    ) -> Result<Vec<LabelScore>, ScanError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ClassifyRequest {
                model: &model.huggingface_id,
                task: &model.task_type,
                text,
            })
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| ScanError::model(&model.name, err))?;

        response
            .json::<Vec<LabelScore>>()
            .await
            .map_err(|err| ScanError::model(&model.name, err))
    }
}
