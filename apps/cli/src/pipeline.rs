//! The fine-tuning pipeline run by `grpo-train`.

use chrono::Utc;
use grpo_training::{
    compute_dataset_id, create_grpo_trainer, default_reward_functions, get_gsm8k_questions, load_model_and_processor,
    make_artifact, validate_examples, write_jsonl_dataset, ArtifactKind, LogProgressSink, Split, TrainOutput, Trainer,
    TrainingConfig, TrainingError, TrainingJobId, TrainingLayout, TrainingManifest, TrainingMetrics,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};

/// A pipeline failure, tagged with the stage that produced it.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to load configuration: {0}")]
    Config(#[source] TrainingError),

    #[error("failed to load dataset: {0}")]
    Dataset(#[source] TrainingError),

    #[error("failed to load model: {0}")]
    Model(#[source] TrainingError),

    #[error("failed to create trainer: {0}")]
    Trainer(#[source] TrainingError),

    #[error("training failed: {0}")]
    Training(#[source] TrainingError),

    #[error("failed to save model: {0}")]
    Save(#[source] TrainingError),

    #[error("failed to write training manifest: {0}")]
    Manifest(#[source] TrainingError),
}

/// What a successful run leaves behind.
#[derive(Debug)]
pub struct RunSummary {
    pub job_id: TrainingJobId,
    pub output_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub global_step: u64,
    pub training_loss: f64,
}

fn log_stage<E: std::fmt::Display>(stage: &'static str) -> impl FnOnce(E) -> E {
    move |e| {
        error!(stage, error = %e, "Pipeline stage failed");
        e
    }
}

/// Load the config, train, and save the adapter with its manifest.
///
/// Failures raised inside the library are logged where they occur; the remaining
/// stages log here before returning.
pub async fn run(config_path: &Path) -> Result<RunSummary, PipelineError> {
    info!(path = %config_path.display(), "Loading configuration");
    let config = TrainingConfig::load(config_path)
        .map_err(log_stage("config"))
        .map_err(PipelineError::Config)?;
    info!(model = %config.model_name, output_dir = %config.output_dir.display(), "Configuration loaded");

    let provider = grpo_backends::dataset_provider(&config.dataset)
        .map_err(log_stage("dataset"))
        .map_err(PipelineError::Dataset)?;
    let train_dataset = load_split(provider.as_ref(), Split::Train).await?;
    let test_dataset = load_split(provider.as_ref(), Split::Test).await?;
    info!(train = train_dataset.len(), test = test_dataset.len(), "Datasets loaded");

    let backend = grpo_backends::policy_backend(&config.backend)
        .map_err(log_stage("model"))
        .map_err(PipelineError::Model)?;
    let (model, tokenizer) = load_model_and_processor(
        backend,
        &config.model_name,
        config.lora_r,
        config.lora_alpha,
        &config.lora_target_modules,
    )
    .await
    .map_err(PipelineError::Model)?;

    let reward_funcs = default_reward_functions();
    info!(
        rewards = ?reward_funcs.iter().map(|f| f.name()).collect::<Vec<_>>(),
        "Reward functions ready"
    );

    let dataset_id = compute_dataset_id(&train_dataset)
        .map_err(log_stage("dataset"))
        .map_err(PipelineError::Dataset)?;
    let lora = model.lora().clone();
    let layout = TrainingLayout::new(config.output_dir.clone());

    let trainer = create_grpo_trainer(model.clone(), tokenizer.clone(), reward_funcs, &config, train_dataset.clone())
        .await
        .map_err(PipelineError::Trainer)?;

    info!("Starting training");
    let output = trainer
        .train(&LogProgressSink)
        .await
        .map_err(log_stage("training"))
        .map_err(PipelineError::Training)?;
    info!(global_step = output.global_step, training_loss = output.training_loss, "Training completed");

    info!(output_dir = %layout.root().display(), "Saving model");
    layout.reset_save_dirs().map_err(log_stage("save")).map_err(PipelineError::Save)?;
    model
        .save_pretrained(&layout.adapter_dir())
        .await
        .map_err(log_stage("save"))
        .map_err(PipelineError::Save)?;
    tokenizer
        .save_pretrained(&layout.tokenizer_dir())
        .await
        .map_err(log_stage("save"))
        .map_err(PipelineError::Save)?;
    info!(output_dir = %layout.root().display(), "Model saved");

    let job_id = TrainingJobId::new();
    let manifest_path = layout.manifest_path();
    let manifest = TrainingManifest {
        job_id: job_id.clone(),
        created_at: Utc::now(),
        base_model: config.model_name.clone(),
        lora,
        dataset_id,
        metrics: metrics(&output),
        artifacts: Vec::new(),
    };
    write_manifest(manifest, config_path, &layout, &train_dataset, &output)
        .map_err(log_stage("manifest"))
        .map_err(PipelineError::Manifest)?;
    info!(job_id = %job_id, path = %manifest_path.display(), "Training manifest written");

    Ok(RunSummary {
        job_id,
        output_dir: config.output_dir,
        manifest_path,
        global_step: output.global_step,
        training_loss: output.training_loss,
    })
}

async fn load_split(
    provider: &dyn grpo_training::DatasetProvider,
    split: Split,
) -> Result<Vec<grpo_training::TrainingExample>, PipelineError> {
    let examples = get_gsm8k_questions(provider, split).await.map_err(PipelineError::Dataset)?;
    let checked = if examples.is_empty() {
        Err(TrainingError::Dataset(format!("{split} split is empty")))
    } else {
        validate_examples(&examples)
    };
    checked
        .map_err(log_stage("dataset"))
        .map_err(PipelineError::Dataset)?;
    Ok(examples)
}

fn metrics(output: &TrainOutput) -> TrainingMetrics {
    let mean_reward = if output.log_history.is_empty() {
        None
    } else {
        Some(output.log_history.iter().map(|e| e.reward).sum::<f64>() / output.log_history.len() as f64)
    };
    TrainingMetrics {
        train_loss: Some(output.training_loss),
        mean_reward,
        steps: Some(output.global_step),
    }
}

fn write_manifest(
    mut manifest: TrainingManifest,
    config_path: &Path,
    layout: &TrainingLayout,
    train_dataset: &[grpo_training::TrainingExample],
    output: &TrainOutput,
) -> Result<(), TrainingError> {
    layout.clear_manifest_outputs()?;
    manifest.artifacts.push(make_artifact(ArtifactKind::Adapter, layout.adapter_dir())?);
    manifest.artifacts.push(make_artifact(ArtifactKind::Tokenizer, layout.tokenizer_dir())?);
    manifest
        .artifacts
        .push(make_artifact(ArtifactKind::TrainerState, TrainingLayout::trainer_state_path(layout.root()))?);
    for checkpoint in &output.checkpoints {
        manifest.artifacts.push(make_artifact(ArtifactKind::Checkpoint, checkpoint.clone())?);
    }

    let dataset_path = layout.dataset_jsonl_path();
    write_jsonl_dataset(&dataset_path, train_dataset)?;
    manifest.artifacts.push(make_artifact(ArtifactKind::DatasetJsonl, dataset_path)?);
    manifest.artifacts.push(make_artifact(ArtifactKind::Config, config_path.to_path_buf())?);

    manifest.write(&layout.manifest_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grpo_training::{DatasetId, LoraConfig, Message, TrainingArtifact, TrainingExample, SYSTEM_PROMPT};
    use std::fs;
    use tempfile::TempDir;

    fn manifest() -> TrainingManifest {
        TrainingManifest {
            job_id: TrainingJobId::new(),
            created_at: Utc::now(),
            base_model: "google/gemma-3-1b-it".to_string(),
            lora: LoraConfig::new(4, 8, vec!["q_proj".to_string()]),
            dataset_id: DatasetId("abc".to_string()),
            metrics: TrainingMetrics::default(),
            artifacts: Vec::new(),
        }
    }

    fn read_artifacts(layout: &TrainingLayout) -> Vec<TrainingArtifact> {
        let text = fs::read_to_string(layout.manifest_path()).unwrap();
        let manifest: TrainingManifest = serde_json::from_str(&text).unwrap();
        manifest.artifacts
    }

    fn sha_of(artifacts: &[TrainingArtifact], kind: &ArtifactKind) -> String {
        artifacts.iter().find(|a| &a.kind == kind).unwrap().sha256.clone()
    }

    #[test]
    fn test_rewriting_manifest_keeps_adapter_digest() {
        let temp = TempDir::new().unwrap();
        let layout = TrainingLayout::new(temp.path().join("out"));
        layout.ensure_root().unwrap();
        layout.reset_save_dirs().unwrap();
        fs::write(layout.adapter_dir().join("adapter_model.safetensors"), b"weights").unwrap();
        fs::write(layout.tokenizer_dir().join("tokenizer.json"), b"{}").unwrap();
        fs::write(TrainingLayout::trainer_state_path(layout.root()), b"{}").unwrap();
        let config_path = temp.path().join("training_config.yaml");
        fs::write(&config_path, "model_name: google/gemma-3-1b-it\n").unwrap();

        let examples = vec![TrainingExample {
            prompt: vec![Message::system(SYSTEM_PROMPT), Message::user("1 + 1?")],
            answer: Some("2".to_string()),
        }];
        let output = TrainOutput { global_step: 1, training_loss: 0.5, log_history: vec![], checkpoints: vec![] };

        write_manifest(manifest(), &config_path, &layout, &examples, &output).unwrap();
        let first = read_artifacts(&layout);
        write_manifest(manifest(), &config_path, &layout, &examples, &output).unwrap();
        let second = read_artifacts(&layout);

        assert_eq!(sha_of(&first, &ArtifactKind::Adapter), sha_of(&second, &ArtifactKind::Adapter));
        assert_eq!(sha_of(&first, &ArtifactKind::Tokenizer), sha_of(&second, &ArtifactKind::Tokenizer));
        assert_ne!(sha_of(&second, &ArtifactKind::Adapter), sha_of(&second, &ArtifactKind::Tokenizer));
        let adapter = second.iter().find(|a| a.kind == ArtifactKind::Adapter).unwrap();
        assert_eq!(adapter.path, layout.adapter_dir());
    }
}
