use crate::dataset::Message;
use crate::error::TrainingResult;
use crate::model::{
    LoraConfig, ModelInfo, ModelLoadRequest, TokenizerInfo, TokenizerLoadRequest, TrainableParameters,
};
use crate::trainer::GrpoConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The training framework that owns the weights.
///
/// Forward passes, adapter injection, the policy loss and the optimizer all live behind
/// this trait. The trainer drives it one step at a time.
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    fn id(&self) -> &'static str;

    async fn load_model(&self, request: &ModelLoadRequest) -> TrainingResult<ModelInfo>;

    async fn load_tokenizer(&self, request: &TokenizerLoadRequest) -> TrainingResult<TokenizerInfo>;

    async fn attach_adapter(&self, lora: &LoraConfig) -> TrainingResult<TrainableParameters>;

    /// Hand over optimizer, schedule and reporting settings before the first step.
    async fn configure(&self, config: &GrpoConfig) -> TrainingResult<()>;

    /// Sample `num_generations` completions per prompt, prompt-major.
    async fn generate(&self, request: &GenerationRequest) -> TrainingResult<Vec<Vec<String>>>;

    /// Apply one policy update from scored completions.
    async fn optimize(&self, update: &PolicyUpdate) -> TrainingResult<UpdateStats>;

    async fn save_model(&self, dir: &Path) -> TrainingResult<()>;

    async fn save_tokenizer(&self, dir: &Path) -> TrainingResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompts: Vec<Vec<Message>>,
    pub num_generations: u32,
    pub max_prompt_length: u32,
    pub max_completion_length: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCompletion {
    /// Index into [`PolicyUpdate::prompts`].
    pub prompt_index: usize,
    pub completion: String,
    pub reward: f64,
    pub advantage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub step: u64,
    pub learning_rate: f64,
    pub prompts: Vec<Vec<Message>>,
    pub completions: Vec<ScoredCompletion>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateStats {
    pub loss: f64,
    #[serde(default)]
    pub grad_norm: Option<f64>,
    #[serde(default)]
    pub kl: Option<f64>,
}
