//! GRPO loop tests against an in-memory policy backend.

use async_trait::async_trait;
use grpo_training::{
    create_grpo_trainer, default_reward_functions, load_model_and_processor, GenerationRequest, GrpoConfig,
    LogProgressSink, LoraConfig, ModelInfo, ModelLoadRequest, PolicyBackend, PolicyUpdate, ProgressEvent, ProgressSink,
    RawRecord, Trainer, TrainerStatus, TrainableParameters, TokenizerInfo, TokenizerLoadRequest, TrainingConfig, TrainingError,
    TrainingExample, TrainingResult, UpdateStats,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const CORRECT: &str = "<reasoning>\n6 x 7 = 42\n</reasoning>\n<answer>\n42\n</answer>\n";
const WRONG: &str = "I am not sure, maybe 41.";

#[derive(Default)]
struct ScriptedBackend {
    configured: Mutex<Vec<GrpoConfig>>,
    updates: Mutex<Vec<PolicyUpdate>>,
    saved_models: Mutex<Vec<PathBuf>>,
    /// When set, `generate` drops the last completion group.
    short_groups: bool,
}

#[async_trait]
impl PolicyBackend for ScriptedBackend {
    fn id(&self) -> &'static str {
        "scripted"
    }

    async fn load_model(&self, request: &ModelLoadRequest) -> TrainingResult<ModelInfo> {
        Ok(ModelInfo { model_name: request.model_name.clone(), num_parameters: 1_000_000 })
    }

    async fn load_tokenizer(&self, request: &TokenizerLoadRequest) -> TrainingResult<TokenizerInfo> {
        Ok(TokenizerInfo {
            model_name: request.model_name.clone(),
            vocab_size: 256,
            special_tokens: request.special_tokens,
        })
    }

    async fn attach_adapter(&self, lora: &LoraConfig) -> TrainingResult<TrainableParameters> {
        Ok(TrainableParameters { trainable_params: u64::from(lora.r) * 1_000, all_params: 1_000_000 })
    }

    async fn configure(&self, config: &GrpoConfig) -> TrainingResult<()> {
        self.configured.lock().unwrap().push(config.clone());
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> TrainingResult<Vec<Vec<String>>> {
        let mut groups: Vec<Vec<String>> = request
            .prompts
            .iter()
            .map(|_| {
                (0..request.num_generations)
                    .map(|i| if i % 2 == 0 { CORRECT.to_string() } else { WRONG.to_string() })
                    .collect()
            })
            .collect();
        if self.short_groups {
            groups.pop();
        }
        Ok(groups)
    }

    async fn optimize(&self, update: &PolicyUpdate) -> TrainingResult<UpdateStats> {
        self.updates.lock().unwrap().push(update.clone());
        Ok(UpdateStats { loss: 0.5 / update.step as f64, grad_norm: Some(0.05), kl: None })
    }

    async fn save_model(&self, dir: &Path) -> TrainingResult<()> {
        std::fs::write(dir.join("adapter_config.json"), "{}")?;
        self.saved_models.lock().unwrap().push(dir.to_path_buf());
        Ok(())
    }

    async fn save_tokenizer(&self, dir: &Path) -> TrainingResult<()> {
        std::fs::write(dir.join("tokenizer_config.json"), "{}")?;
        Ok(())
    }
}

fn training_config(output_dir: &Path) -> TrainingConfig {
    let yaml = format!(
        r"
model_name: google/gemma-3-1b-it
lora_r: 8
lora_alpha: 16
lora_target_modules: [q_proj, v_proj]
learning_rate: 1.0e-5
weight_decay: 0.1
warmup_ratio: 0.1
batch_size: 4
gradient_accumulation_steps: 1
num_generations: 2
max_prompt_length: 128
max_completion_length: 64
num_epochs: 1
max_steps: 4
save_steps: 2
logging_steps: 1
report_to: none
output_dir: {}
",
        output_dir.display()
    );
    TrainingConfig::from_yaml_str(&yaml).unwrap()
}

fn dataset(n: usize) -> Vec<TrainingExample> {
    (0..n)
        .map(|i| {
            TrainingExample::from_record(RawRecord {
                question: format!("Question {i}: what is 6 x 7?"),
                answer: "6 x 7 = 42\n#### 42".to_string(),
            })
        })
        .collect()
}

#[tokio::test]
async fn test_load_model_and_processor_builds_handles() {
    let backend = Arc::new(ScriptedBackend::default());
    let targets = vec!["q_proj".to_string(), "v_proj".to_string()];
    let (model, tokenizer) = load_model_and_processor(backend, "google/gemma-3-1b-it", 8, 16, &targets)
        .await
        .unwrap();

    assert_eq!(model.info().model_name, "google/gemma-3-1b-it");
    assert_eq!(model.lora().target_modules, targets);
    assert_eq!(model.trainable_parameters().trainable_params, 8_000);
    assert_eq!(tokenizer.info().special_tokens.pad_token_id, 0);
    assert_eq!(tokenizer.info().special_tokens.eos_token_id, 2);
}

#[tokio::test]
async fn test_train_runs_steps_and_saves_checkpoints() {
    let temp = TempDir::new().unwrap();
    let output_dir = temp.path().join("outputs");
    let config = training_config(&output_dir);

    let backend = Arc::new(ScriptedBackend::default());
    let (model, tokenizer) = load_model_and_processor(
        backend.clone(),
        &config.model_name,
        config.lora_r,
        config.lora_alpha,
        &config.lora_target_modules,
    )
    .await
    .unwrap();

    let trainer = create_grpo_trainer(model, tokenizer, default_reward_functions(), &config, dataset(5))
        .await
        .unwrap();
    assert_eq!(backend.configured.lock().unwrap().len(), 1);
    assert_eq!(trainer.total_steps(), 4);

    let output = trainer.train(&LogProgressSink).await.unwrap();
    assert_eq!(trainer.status(), TrainerStatus::Finished);
    assert_eq!(output.global_step, 4);
    assert_eq!(output.log_history.len(), 4);
    assert_eq!(output.checkpoints, vec![output_dir.join("checkpoint-2"), output_dir.join("checkpoint-4")]);
    assert!(output_dir.join("checkpoint-2").join("adapter_config.json").exists());
    assert!(output_dir.join("checkpoint-4").join("trainer_state.json").exists());
    assert!(output_dir.join("trainer_state.json").exists());

    let updates = backend.updates.lock().unwrap();
    assert_eq!(updates.len(), 4);
    // batch 4 / 2 generations = 2 prompts per step
    for update in updates.iter() {
        assert_eq!(update.prompts.len(), 2);
        assert_eq!(update.completions.len(), 4);
        let correct = &update.completions[0];
        let wrong = &update.completions[1];
        assert_eq!(correct.prompt_index, 0);
        assert!(correct.reward > wrong.reward);
        assert!(correct.advantage > 0.0 && wrong.advantage < 0.0);
    }
    assert_eq!(updates[0].learning_rate, 0.0);
    assert!(updates[1].learning_rate > updates[3].learning_rate);

    let first = &output.log_history[0];
    assert_eq!(first.rewards["correctness"], 1.0);
    assert_eq!(first.rewards["strict_format"], 0.25);
    assert!(first.reward > 0.0);
}

#[tokio::test]
async fn test_train_fails_on_short_generation_batch() {
    let temp = TempDir::new().unwrap();
    let config = training_config(temp.path());

    let backend = Arc::new(ScriptedBackend { short_groups: true, ..Default::default() });
    let (model, tokenizer) =
        load_model_and_processor(backend, &config.model_name, 8, 16, &config.lora_target_modules)
            .await
            .unwrap();
    let trainer = create_grpo_trainer(model, tokenizer, default_reward_functions(), &config, dataset(3))
        .await
        .unwrap();

    let err = trainer.train(&LogProgressSink).await.unwrap_err();
    assert!(matches!(err, TrainingError::Trainer(_)));
    assert!(matches!(trainer.status(), TrainerStatus::Failed(_)));
}

#[tokio::test]
async fn test_cancel_stops_before_next_step() {
    let temp = TempDir::new().unwrap();
    let config = training_config(temp.path());

    let backend = Arc::new(ScriptedBackend::default());
    let (model, tokenizer) =
        load_model_and_processor(backend.clone(), &config.model_name, 8, 16, &config.lora_target_modules)
            .await
            .unwrap();
    let trainer = create_grpo_trainer(model, tokenizer, default_reward_functions(), &config, dataset(3))
        .await
        .unwrap();

    trainer.cancel();
    let err = trainer.train(&LogProgressSink).await.unwrap_err();
    assert!(matches!(err, TrainingError::Cancelled(0)));
    assert!(backend.updates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_create_trainer_rejects_empty_inputs() {
    let temp = TempDir::new().unwrap();
    let config = training_config(temp.path());
    let backend = Arc::new(ScriptedBackend::default());
    let (model, tokenizer) =
        load_model_and_processor(backend, &config.model_name, 8, 16, &config.lora_target_modules)
            .await
            .unwrap();

    let no_rewards = create_grpo_trainer(model.clone(), tokenizer.clone(), Vec::new(), &config, dataset(3)).await;
    assert!(matches!(no_rewards, Err(TrainingError::Trainer(_))));

    let no_data = create_grpo_trainer(model, tokenizer, default_reward_functions(), &config, Vec::new()).await;
    assert!(matches!(no_data, Err(TrainingError::Dataset(_))));
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressSink for RecordingSink {
    fn on_event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn test_progress_events_follow_the_loop() {
    let temp = TempDir::new().unwrap();
    let output_dir = temp.path().join("outputs");
    let config = training_config(&output_dir);

    let backend = Arc::new(ScriptedBackend::default());
    let (model, tokenizer) =
        load_model_and_processor(backend, &config.model_name, 8, 16, &config.lora_target_modules)
            .await
            .unwrap();
    let trainer = create_grpo_trainer(model, tokenizer, default_reward_functions(), &config, dataset(5))
        .await
        .unwrap();

    let sink = RecordingSink::default();
    trainer.train(&sink).await.unwrap();
    let events = sink.events.lock().unwrap();

    assert!(matches!(events.first(), Some(ProgressEvent::Started { total_steps: 4 })));
    assert!(matches!(events.last(), Some(ProgressEvent::Finished { global_step: 4 })));
    let steps: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Step { step, total: 4, .. } => Some(*step),
            _ => None,
        })
        .collect();
    assert_eq!(steps, vec![1, 2, 3, 4]);
    let checkpoints: Vec<(u64, PathBuf)> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Checkpoint { step, path } => Some((*step, path.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        checkpoints,
        vec![(2, output_dir.join("checkpoint-2")), (4, output_dir.join("checkpoint-4"))]
    );
}
