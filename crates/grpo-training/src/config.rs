use crate::dataset::DatasetSource;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the training configuration, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/training_config.yaml";

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";

/// Training configuration as read from the YAML document.
///
/// Every top-level key except `backend` and `dataset` is required. LoRA dropout and
/// bias are fixed in [`crate::model::LoraConfig`] and are not configurable here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub model_name: String,
    pub lora_r: u32,
    pub lora_alpha: u32,
    pub lora_target_modules: Vec<String>,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub warmup_ratio: f64,
    pub batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub num_generations: u32,
    pub max_prompt_length: u32,
    pub max_completion_length: u32,
    pub num_epochs: u32,
    /// Hard step limit. Zero or negative means "derive from `num_epochs`".
    pub max_steps: i64,
    pub save_steps: u64,
    pub logging_steps: u64,
    #[serde(deserialize_with = "string_or_list")]
    pub report_to: Vec<String>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub dataset: DatasetSource,
}

/// Where the policy backend lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default = "default_backend_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self { base_url: default_backend_url(), timeout_secs: default_timeout_secs() }
    }
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

const fn default_timeout_secs() -> u64 {
    600
}

/// Accepts `report_to: none` as well as `report_to: [wandb, tensorboard]`.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl TrainingConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> TrainingResult<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrainingError::ConfigNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> TrainingResult<Self> {
        let config: Self =
            serde_yaml::from_str(contents).map_err(|e| TrainingError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the model and adapter settings. Optimizer settings are checked by
    /// [`crate::trainer::GrpoConfig::validate`] when the trainer is built.
    pub fn validate(&self) -> TrainingResult<()> {
        if self.model_name.trim().is_empty() {
            return Err(TrainingError::InvalidConfig("model_name is required".to_string()));
        }
        if self.lora_r == 0 {
            return Err(TrainingError::InvalidConfig("lora_r must be >= 1".to_string()));
        }
        if self.lora_alpha == 0 {
            return Err(TrainingError::InvalidConfig("lora_alpha must be >= 1".to_string()));
        }
        if self.lora_target_modules.iter().all(|m| m.trim().is_empty()) {
            return Err(TrainingError::InvalidConfig(
                "lora_target_modules must name at least one module".to_string(),
            ));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(TrainingError::InvalidConfig("output_dir is required".to_string()));
        }
        if self.backend.base_url.trim().is_empty() {
            return Err(TrainingError::InvalidConfig("backend.base_url must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_yaml() -> &'static str {
    r"
model_name: google/gemma-3-1b-it
lora_r: 16
lora_alpha: 32
lora_target_modules: [q_proj, k_proj, v_proj, o_proj]
learning_rate: 5.0e-6
weight_decay: 0.1
warmup_ratio: 0.1
batch_size: 4
gradient_accumulation_steps: 1
num_generations: 4
max_prompt_length: 256
max_completion_length: 200
num_epochs: 1
max_steps: 250
save_steps: 50
logging_steps: 1
report_to: none
output_dir: outputs/gemma-3-grpo
"
}
