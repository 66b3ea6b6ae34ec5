//! HTTP policy backend.
//!
//! Talks JSON to an out-of-process training server that owns the model weights, the
//! adapter and the optimizer. Every call is a `POST` under `/v1`.

use async_trait::async_trait;
use grpo_training::{
    BackendSettings, GenerationRequest, GrpoConfig, LoraConfig, ModelInfo, ModelLoadRequest, PolicyBackend,
    PolicyUpdate, TokenizerInfo, TokenizerLoadRequest, TrainableParameters, TrainingError, TrainingResult,
    UpdateStats,
};
use reqwest::Client;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Policy backend reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPolicyBackend {
    /// Server root, without trailing slash (e.g. "http://127.0.0.1:8000").
    base_url: String,
    client: Client,
}

#[derive(Serialize)]
struct SaveRequest<'a> {
    output_dir: &'a Path,
}

#[derive(Deserialize)]
struct GenerateResponse {
    completions: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct ServerError {
    error: String,
}

impl HttpPolicyBackend {
    /// Creates a backend for `base_url` with a per-request timeout.
    ///
    /// # Errors
    /// Returns a `Backend` error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> TrainingResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrainingError::Backend(format!("failed to build HTTP client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, client })
    }

    pub fn from_settings(settings: &BackendSettings) -> TrainingResult<Self> {
        Self::new(settings.base_url.clone(), Duration::from_secs(settings.timeout_secs))
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> TrainingResult<R>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "policy backend request");

        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            debug!(error = %e, base_url = %self.base_url, "policy backend request failed");
            if e.is_connect() {
                TrainingError::Backend(format!("policy backend not reachable at {}", self.base_url))
            } else if e.is_timeout() {
                TrainingError::Backend(format!("policy backend timed out on {path}"))
            } else {
                TrainingError::Backend(format!("network error: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            debug!(status = %status, error = %error_text, path, "policy backend returned error status");
            let message = serde_json::from_str::<ServerError>(&error_text)
                .map(|e| e.error)
                .unwrap_or(error_text);
            return Err(TrainingError::Backend(format!("{path} failed ({status}): {message}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| TrainingError::Backend(format!("failed to read {path} response: {e}")))?;
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| {
            debug!(error = %e, path, "policy backend response did not parse");
            TrainingError::Backend(format!("failed to parse {path} response: {e}"))
        })
    }
}

#[async_trait]
impl PolicyBackend for HttpPolicyBackend {
    fn id(&self) -> &'static str {
        "http"
    }

    async fn load_model(&self, request: &ModelLoadRequest) -> TrainingResult<ModelInfo> {
        self.post("/v1/model/load", request).await
    }

    async fn load_tokenizer(&self, request: &TokenizerLoadRequest) -> TrainingResult<TokenizerInfo> {
        self.post("/v1/tokenizer/load", request).await
    }

    async fn attach_adapter(&self, lora: &LoraConfig) -> TrainingResult<TrainableParameters> {
        self.post("/v1/adapter", lora).await
    }

    async fn configure(&self, config: &GrpoConfig) -> TrainingResult<()> {
        let _: IgnoredAny = self.post("/v1/trainer/configure", config).await?;
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> TrainingResult<Vec<Vec<String>>> {
        let response: GenerateResponse = self.post("/v1/generate", request).await?;
        Ok(response.completions)
    }

    async fn optimize(&self, update: &PolicyUpdate) -> TrainingResult<UpdateStats> {
        self.post("/v1/optimize", update).await
    }

    async fn save_model(&self, dir: &Path) -> TrainingResult<()> {
        let _: IgnoredAny = self.post("/v1/model/save", &SaveRequest { output_dir: dir }).await?;
        Ok(())
    }

    async fn save_tokenizer(&self, dir: &Path) -> TrainingResult<()> {
        let _: IgnoredAny = self.post("/v1/tokenizer/save", &SaveRequest { output_dir: dir }).await?;
        Ok(())
    }
}
