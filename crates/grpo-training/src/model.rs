//! Pretrained model loading and low-rank adapter setup.
//!
//! The weights live in the policy backend; this side only describes what to load and
//! keeps handles that can persist the result.

use crate::backend::PolicyBackend;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const LORA_DROPOUT: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    CausalLm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraBias {
    None,
}

/// Low-rank adapter settings. Dropout and bias are fixed for this workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub task_type: TaskType,
    pub r: u32,
    pub lora_alpha: u32,
    pub target_modules: Vec<String>,
    pub lora_dropout: f64,
    pub bias: LoraBias,
    pub inference_mode: bool,
}

impl LoraConfig {
    #[must_use]
    pub fn new(r: u32, lora_alpha: u32, target_modules: Vec<String>) -> Self {
        Self {
            task_type: TaskType::CausalLm,
            r,
            lora_alpha,
            target_modules,
            lora_dropout: LORA_DROPOUT,
            bias: LoraBias::None,
            inference_mode: false,
        }
    }

    /// Multiplier applied to the adapter output (`alpha / r`).
    #[must_use]
    pub fn scaling(&self) -> f64 {
        f64::from(self.lora_alpha) / f64::from(self.r.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorchDtype {
    Bfloat16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLoadRequest {
    pub model_name: String,
    pub torch_dtype: TorchDtype,
    pub device_map: String,
    pub attn_implementation: String,
}

impl ModelLoadRequest {
    /// bf16 weights dispatched across available devices, eager attention.
    #[must_use]
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            torch_dtype: TorchDtype::Bfloat16,
            device_map: "auto".to_string(),
            attn_implementation: "eager".to_string(),
        }
    }
}

/// Token id overrides applied to the tokenizer after loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub pad_token_id: u32,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self { pad_token_id: 0, bos_token_id: 1, eos_token_id: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerLoadRequest {
    pub model_name: String,
    #[serde(flatten)]
    pub special_tokens: SpecialTokens,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_name: String,
    #[serde(default)]
    pub num_parameters: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerInfo {
    pub model_name: String,
    #[serde(default)]
    pub vocab_size: u64,
    #[serde(flatten)]
    pub special_tokens: SpecialTokens,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainableParameters {
    pub trainable_params: u64,
    pub all_params: u64,
}

impl TrainableParameters {
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.all_params == 0 {
            return 0.0;
        }
        100.0 * self.trainable_params as f64 / self.all_params as f64
    }
}

impl std::fmt::Display for TrainableParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable_params,
            self.all_params,
            self.percent()
        )
    }
}

/// A loaded model with its adapter attached.
#[derive(Clone)]
pub struct ModelHandle {
    backend: Arc<dyn PolicyBackend>,
    info: ModelInfo,
    lora: LoraConfig,
    trainable: TrainableParameters,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("backend", &self.backend.id())
            .field("info", &self.info)
            .field("lora", &self.lora)
            .field("trainable", &self.trainable)
            .finish()
    }
}

impl ModelHandle {
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn PolicyBackend> {
        &self.backend
    }

    #[must_use]
    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    #[must_use]
    pub fn lora(&self) -> &LoraConfig {
        &self.lora
    }

    #[must_use]
    pub fn trainable_parameters(&self) -> TrainableParameters {
        self.trainable
    }

    /// Persist the adapter weights and config into `dir`.
    pub async fn save_pretrained(&self, dir: &Path) -> TrainingResult<()> {
        self.backend.save_model(dir).await
    }
}

#[derive(Clone)]
pub struct TokenizerHandle {
    backend: Arc<dyn PolicyBackend>,
    info: TokenizerInfo,
}

impl std::fmt::Debug for TokenizerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerHandle")
            .field("backend", &self.backend.id())
            .field("info", &self.info)
            .finish()
    }
}

impl TokenizerHandle {
    #[must_use]
    pub fn info(&self) -> &TokenizerInfo {
        &self.info
    }

    pub async fn save_pretrained(&self, dir: &Path) -> TrainingResult<()> {
        self.backend.save_tokenizer(dir).await
    }
}

/// Load the pretrained model and tokenizer, then attach a LoRA adapter.
pub async fn load_model_and_processor(
    backend: Arc<dyn PolicyBackend>,
    model_name: &str,
    lora_r: u32,
    lora_alpha: u32,
    lora_target_modules: &[String],
) -> TrainingResult<(ModelHandle, TokenizerHandle)> {
    debug!(model_name, lora_r, lora_alpha, ?lora_target_modules, backend = backend.id(), "load_model_and_processor");

    info!(model_name, "Loading model");
    let info = backend.load_model(&ModelLoadRequest::new(model_name)).await.map_err(|e| {
        error!(error = %e, model_name, "Failed to load the model");
        TrainingError::Model(format!("failed to load model {model_name}: {e}"))
    })?;
    info!(model_name, num_parameters = info.num_parameters, "Model loaded successfully");

    info!(model_name, "Loading tokenizer");
    let request = TokenizerLoadRequest { model_name: model_name.to_string(), special_tokens: SpecialTokens::default() };
    let tokenizer_info = backend.load_tokenizer(&request).await.map_err(|e| {
        error!(error = %e, model_name, "Failed to load the tokenizer");
        TrainingError::Model(format!("failed to load tokenizer {model_name}: {e}"))
    })?;
    debug!(
        pad_token_id = tokenizer_info.special_tokens.pad_token_id,
        bos_token_id = tokenizer_info.special_tokens.bos_token_id,
        eos_token_id = tokenizer_info.special_tokens.eos_token_id,
        "Tokenizer loaded successfully"
    );

    info!("Setting up LoRA");
    let lora = LoraConfig::new(lora_r, lora_alpha, lora_target_modules.to_vec());
    let trainable = backend.attach_adapter(&lora).await.map_err(|e| {
        error!(error = %e, "Failed to set up LoRA");
        TrainingError::Model(format!("failed to attach LoRA adapter: {e}"))
    })?;
    info!(r = lora.r, lora_alpha = lora.lora_alpha, scaling = lora.scaling(), "LoRA adapter attached");
    info!("{trainable}");

    let model = ModelHandle { backend: Arc::clone(&backend), info, lora, trainable };
    let tokenizer = TokenizerHandle { backend, info: tokenizer_info };
    Ok((model, tokenizer))
}
