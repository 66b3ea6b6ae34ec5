//! GRPO Training
//!
//! Backend-agnostic primitives for fine-tuning a causal language model on GSM8K with
//! group-relative policy optimization:
//! - Loading the training configuration (`TrainingConfig`)
//! - Mapping GSM8K records into chat prompts (`TrainingExample`)
//! - Scoring completions (`RewardFunction`)
//! - Driving the GRPO loop against a `PolicyBackend` (`GrpoTrainer`)
//! - Writing checkpoints, trainer state and manifests

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod dataset;
pub mod error;
pub mod layout;
pub mod model;
pub mod progress;
pub mod provider;
pub mod reward;
pub mod trainer;
pub mod xml;

pub use artifacts::{make_artifact, ArtifactKind, TrainingArtifact, TrainingJobId, TrainingManifest, TrainingMetrics};
pub use backend::{GenerationRequest, PolicyBackend, PolicyUpdate, ScoredCompletion, UpdateStats};
pub use config::{BackendSettings, TrainingConfig, DEFAULT_CONFIG_PATH};
pub use dataset::{
    compute_dataset_id, extract_hash_answer, get_gsm8k_questions, validate_examples, DatasetId, DatasetSource,
    Message, RawRecord, Role, Split, TrainingExample, SYSTEM_PROMPT,
};
pub use error::{TrainingError, TrainingResult};
pub use layout::TrainingLayout;
pub use model::{
    load_model_and_processor, LoraConfig, ModelHandle, ModelInfo, ModelLoadRequest, SpecialTokens, TokenizerHandle,
    TokenizerInfo, TokenizerLoadRequest, TrainableParameters,
};
pub use progress::{LogProgressSink, ProgressEvent, ProgressSink};
pub use provider::{read_jsonl_records, write_jsonl_dataset, DatasetProvider, JsonlDatasetProvider};
pub use reward::{default_reward_functions, RewardFunction, Rollout};
pub use trainer::{
    compute_group_advantages, create_grpo_trainer, GrpoConfig, GrpoTrainer, LogEntry, TrainOutput, Trainer,
    TrainerStatus,
};
pub use xml::{count_xml, extract_xml_answer};
