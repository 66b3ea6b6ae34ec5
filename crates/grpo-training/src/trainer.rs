use crate::backend::{GenerationRequest, PolicyUpdate, ScoredCompletion};
use crate::config::TrainingConfig;
use crate::dataset::{Message, TrainingExample};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::TrainingLayout;
use crate::model::{ModelHandle, TokenizerHandle};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::reward::{RewardFunction, Rollout};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Added to the group standard deviation before dividing.
pub const ADVANTAGE_EPSILON: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    Cosine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    AdamwTorch,
}

/// Arguments handed to the GRPO loop and, through `configure`, to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrpoConfig {
    pub learning_rate: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub weight_decay: f64,
    pub warmup_ratio: f64,
    pub lr_scheduler_type: SchedulerType,
    pub optim: OptimizerKind,
    pub logging_steps: u64,
    pub per_device_train_batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub num_generations: u32,
    pub max_prompt_length: u32,
    pub max_completion_length: u32,
    pub num_train_epochs: u32,
    pub max_steps: i64,
    pub save_steps: u64,
    pub max_grad_norm: f64,
    pub report_to: Vec<String>,
    pub output_dir: PathBuf,
    pub seed: u64,
    pub temperature: f64,
}

impl GrpoConfig {
    pub fn from_training_config(config: &TrainingConfig) -> TrainingResult<Self> {
        let args = Self {
            learning_rate: config.learning_rate,
            adam_beta1: 0.9,
            adam_beta2: 0.99,
            weight_decay: config.weight_decay,
            warmup_ratio: config.warmup_ratio,
            lr_scheduler_type: SchedulerType::Cosine,
            optim: OptimizerKind::AdamwTorch,
            logging_steps: config.logging_steps,
            per_device_train_batch_size: config.batch_size,
            gradient_accumulation_steps: config.gradient_accumulation_steps,
            num_generations: config.num_generations,
            max_prompt_length: config.max_prompt_length,
            max_completion_length: config.max_completion_length,
            num_train_epochs: config.num_epochs,
            max_steps: config.max_steps,
            save_steps: config.save_steps,
            max_grad_norm: 0.1,
            report_to: config.report_to.clone(),
            output_dir: config.output_dir.clone(),
            seed: 42,
            temperature: 0.9,
        };
        args.validate()?;
        Ok(args)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        let invalid = |msg: &str| Err(TrainingError::InvalidConfig(msg.to_string()));

        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return invalid("learning_rate must be > 0");
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return invalid("weight_decay must be >= 0");
        }
        if !(0.0..1.0).contains(&self.warmup_ratio) {
            return invalid("warmup_ratio must be in [0, 1)");
        }
        if self.per_device_train_batch_size == 0 {
            return invalid("batch_size must be >= 1");
        }
        if self.gradient_accumulation_steps == 0 {
            return invalid("gradient_accumulation_steps must be >= 1");
        }
        if self.num_generations < 2 {
            return invalid("num_generations must be >= 2 for group-relative advantages");
        }
        if self.generation_batch_size() % u64::from(self.num_generations) != 0 {
            return Err(TrainingError::InvalidConfig(format!(
                "batch_size * gradient_accumulation_steps ({}) must be divisible by num_generations ({})",
                self.generation_batch_size(),
                self.num_generations
            )));
        }
        if self.max_prompt_length == 0 || self.max_completion_length == 0 {
            return invalid("max_prompt_length and max_completion_length must be >= 1");
        }
        if self.logging_steps == 0 {
            return invalid("logging_steps must be >= 1");
        }
        if self.save_steps == 0 {
            return invalid("save_steps must be >= 1");
        }
        if self.max_steps <= 0 && self.num_train_epochs == 0 {
            return invalid("either max_steps or num_epochs must be positive");
        }
        Ok(())
    }

    /// Completions scored per optimizer step.
    #[must_use]
    pub fn generation_batch_size(&self) -> u64 {
        u64::from(self.per_device_train_batch_size) * u64::from(self.gradient_accumulation_steps)
    }

    /// Unique prompts consumed per optimizer step.
    #[must_use]
    pub fn prompts_per_step(&self) -> usize {
        (self.generation_batch_size() / u64::from(self.num_generations.max(1))).max(1) as usize
    }

    #[must_use]
    pub fn total_steps(&self, dataset_len: usize) -> u64 {
        if self.max_steps > 0 {
            return self.max_steps as u64;
        }
        let per_epoch = dataset_len.div_ceil(self.prompts_per_step()) as u64;
        per_epoch * u64::from(self.num_train_epochs)
    }

    #[must_use]
    pub fn warmup_steps(&self, total_steps: u64) -> u64 {
        (self.warmup_ratio * total_steps as f64).ceil() as u64
    }

    /// Linear warmup to `learning_rate`, then cosine decay to zero at `total_steps`.
    #[must_use]
    pub fn learning_rate_at(&self, step: u64, total_steps: u64) -> f64 {
        let warmup = self.warmup_steps(total_steps);
        if step < warmup {
            return self.learning_rate * step as f64 / warmup as f64;
        }
        let decay_steps = total_steps.saturating_sub(warmup).max(1);
        let progress = ((step - warmup) as f64 / decay_steps as f64).min(1.0);
        self.learning_rate * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

/// Normalize rewards within consecutive groups of `group_size`.
///
/// Each reward becomes `(r - mean) / (std + ADVANTAGE_EPSILON)` where `std` is the
/// sample standard deviation of its group.
pub fn compute_group_advantages(rewards: &[f64], group_size: usize) -> Vec<f64> {
    rewards
        .chunks(group_size.max(1))
        .flat_map(|group| {
            let mean = mean(group);
            let std = sample_std(group, mean);
            group.iter().map(move |r| (r - mean) / (std + ADVANTAGE_EPSILON))
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Metrics recorded for one optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: u64,
    pub epoch: f64,
    pub loss: f64,
    pub grad_norm: Option<f64>,
    pub kl: Option<f64>,
    pub learning_rate: f64,
    /// Mean total reward over the batch.
    pub reward: f64,
    /// Mean of the per-group reward standard deviations.
    pub reward_std: f64,
    /// Mean reward per reward function, keyed by name.
    pub rewards: BTreeMap<String, f64>,
    /// Mean completion length in characters.
    pub completion_length: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: u64,
    pub max_steps: u64,
    pub num_train_epochs: u32,
    pub logging_steps: u64,
    pub save_steps: u64,
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    pub fn write(&self, path: &Path) -> TrainingResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub global_step: u64,
    /// Mean loss over all steps.
    pub training_loss: f64,
    pub log_history: Vec<LogEntry>,
    pub checkpoints: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainerStatus {
    Idle,
    Preparing,
    Running,
    Finished,
    Failed(String),
    Cancelled,
}

#[async_trait]
pub trait Trainer: Send + Sync {
    fn id(&self) -> &'static str;

    async fn train(&self, progress: &dyn ProgressSink) -> TrainingResult<TrainOutput>;

    fn status(&self) -> TrainerStatus;

    /// Request a stop; observed at the next step boundary.
    fn cancel(&self);
}

/// Group-relative policy optimization driven through a [`crate::backend::PolicyBackend`].
pub struct GrpoTrainer {
    model: ModelHandle,
    tokenizer: TokenizerHandle,
    reward_funcs: Vec<Box<dyn RewardFunction>>,
    args: GrpoConfig,
    train_dataset: Vec<TrainingExample>,
    layout: TrainingLayout,
    status: Arc<Mutex<TrainerStatus>>,
}

struct StepOutcome {
    entry: LogEntry,
}

impl GrpoTrainer {
    pub async fn new(
        model: ModelHandle,
        tokenizer: TokenizerHandle,
        reward_funcs: Vec<Box<dyn RewardFunction>>,
        args: GrpoConfig,
        train_dataset: Vec<TrainingExample>,
    ) -> TrainingResult<Self> {
        args.validate()?;
        if reward_funcs.is_empty() {
            return Err(TrainingError::Trainer("at least one reward function is required".to_string()));
        }
        if train_dataset.is_empty() {
            return Err(TrainingError::Dataset("training dataset must not be empty".to_string()));
        }

        let status = Arc::new(Mutex::new(TrainerStatus::Preparing));
        model.backend().configure(&args).await?;

        let layout = TrainingLayout::new(args.output_dir.clone());
        Ok(Self {
            model,
            tokenizer,
            reward_funcs,
            args,
            train_dataset,
            layout,
            status,
        })
    }

    #[must_use]
    pub fn args(&self) -> &GrpoConfig {
        &self.args
    }

    #[must_use]
    pub fn total_steps(&self) -> u64 {
        self.args.total_steps(self.train_dataset.len())
    }

    fn set_status(&self, status: TrainerStatus) {
        if let Ok(mut s) = self.status.lock() {
            *s = status;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.status.lock().map(|s| *s == TrainerStatus::Cancelled).unwrap_or(false)
    }

    async fn run_loop(&self, progress: &dyn ProgressSink) -> TrainingResult<TrainOutput> {
        let total_steps = self.total_steps();
        let prompts_per_step = self.args.prompts_per_step();
        let dataset_len = self.train_dataset.len();

        self.layout.ensure_root()?;
        progress.on_event(ProgressEvent::Started { total_steps });

        let mut rng = StdRng::seed_from_u64(self.args.seed);
        let mut order: Vec<usize> = (0..dataset_len).collect();
        order.shuffle(&mut rng);
        let mut cursor = 0;
        let mut consumed = 0usize;

        let mut log_history = Vec::new();
        let mut checkpoints = Vec::new();

        for step in 1..=total_steps {
            if self.is_cancelled() {
                return Err(TrainingError::Cancelled(step - 1));
            }

            let mut batch = Vec::with_capacity(prompts_per_step);
            while batch.len() < prompts_per_step {
                if cursor == order.len() {
                    order.shuffle(&mut rng);
                    cursor = 0;
                }
                batch.push(&self.train_dataset[order[cursor]]);
                cursor += 1;
            }
            consumed += batch.len();

            let epoch = consumed as f64 / dataset_len as f64;
            let outcome = self.training_step(step, total_steps, epoch, &batch).await?;
            let entry = outcome.entry;
            log_history.push(entry.clone());

            if step % self.args.logging_steps == 0 || step == total_steps {
                progress.on_event(ProgressEvent::Step { step, total: total_steps, metrics: entry });
            }

            if step % self.args.save_steps == 0 {
                let dir = self.save_checkpoint(step, total_steps, &log_history).await?;
                progress.on_event(ProgressEvent::Checkpoint { step, path: dir.clone() });
                checkpoints.push(dir);
            }
        }

        let state = self.trainer_state(total_steps, total_steps, &log_history);
        state.write(&TrainingLayout::trainer_state_path(self.layout.root()))?;

        let training_loss = mean(&log_history.iter().map(|e| e.loss).collect::<Vec<_>>());
        progress.on_event(ProgressEvent::Finished { global_step: total_steps });
        Ok(TrainOutput { global_step: total_steps, training_loss, log_history, checkpoints })
    }

    async fn training_step(
        &self,
        step: u64,
        total_steps: u64,
        epoch: f64,
        batch: &[&TrainingExample],
    ) -> TrainingResult<StepOutcome> {
        let group_size = self.args.num_generations as usize;
        let prompts: Vec<Vec<Message>> = batch.iter().map(|ex| ex.prompt.clone()).collect();

        let request = GenerationRequest {
            prompts: prompts.clone(),
            num_generations: self.args.num_generations,
            max_prompt_length: self.args.max_prompt_length,
            max_completion_length: self.args.max_completion_length,
            temperature: self.args.temperature,
        };
        let groups = self.model.backend().generate(&request).await?;
        if groups.len() != batch.len() {
            return Err(TrainingError::Trainer(format!(
                "backend returned {} completion groups for {} prompts",
                groups.len(),
                batch.len()
            )));
        }

        let mut rollouts = Vec::with_capacity(batch.len() * group_size);
        for (example, completions) in batch.iter().zip(groups) {
            if completions.len() != group_size {
                return Err(TrainingError::Trainer(format!(
                    "backend returned {} completions, expected {}",
                    completions.len(),
                    group_size
                )));
            }
            rollouts.extend(completions.into_iter().map(|completion| Rollout {
                prompt: example.prompt.clone(),
                completion,
                answer: example.answer.clone(),
            }));
        }

        let mut totals = vec![0.0; rollouts.len()];
        let mut reward_means = BTreeMap::new();
        for func in &self.reward_funcs {
            let scores = func.score(&rollouts);
            if scores.len() != rollouts.len() {
                return Err(TrainingError::Trainer(format!(
                    "reward function {} returned {} scores for {} completions",
                    func.name(),
                    scores.len(),
                    rollouts.len()
                )));
            }
            for (total, score) in totals.iter_mut().zip(&scores) {
                *total += score;
            }
            reward_means.insert(func.name().to_string(), mean(&scores));
        }

        let advantages = compute_group_advantages(&totals, group_size);
        let reward_std = mean(
            &totals
                .chunks(group_size)
                .map(|g| sample_std(g, mean(g)))
                .collect::<Vec<_>>(),
        );
        let completion_length =
            mean(&rollouts.iter().map(|r| r.completion.chars().count() as f64).collect::<Vec<_>>());

        let completions = rollouts
            .into_iter()
            .enumerate()
            .map(|(i, rollout)| ScoredCompletion {
                prompt_index: i / group_size,
                completion: rollout.completion,
                reward: totals[i],
                advantage: advantages[i],
            })
            .collect();

        let learning_rate = self.args.learning_rate_at(step - 1, total_steps);
        let update = PolicyUpdate { step, learning_rate, prompts, completions };
        let stats = self.model.backend().optimize(&update).await?;
        debug!(step, loss = stats.loss, learning_rate, "policy update applied");

        Ok(StepOutcome {
            entry: LogEntry {
                step,
                epoch,
                loss: stats.loss,
                grad_norm: stats.grad_norm,
                kl: stats.kl,
                learning_rate,
                reward: mean(&totals),
                reward_std,
                rewards: reward_means,
                completion_length,
            },
        })
    }

    async fn save_checkpoint(&self, step: u64, total_steps: u64, log_history: &[LogEntry]) -> TrainingResult<PathBuf> {
        let dir = self.layout.checkpoint_dir(step);
        std::fs::create_dir_all(&dir)?;
        self.model.save_pretrained(&dir).await?;
        self.tokenizer.save_pretrained(&dir).await?;
        self.trainer_state(step, total_steps, log_history)
            .write(&TrainingLayout::trainer_state_path(&dir))?;
        Ok(dir)
    }

    fn trainer_state(&self, global_step: u64, max_steps: u64, log_history: &[LogEntry]) -> TrainerState {
        TrainerState {
            global_step,
            max_steps,
            num_train_epochs: self.args.num_train_epochs,
            logging_steps: self.args.logging_steps,
            save_steps: self.args.save_steps,
            log_history: log_history.to_vec(),
        }
    }
}

#[async_trait]
impl Trainer for GrpoTrainer {
    fn id(&self) -> &'static str {
        "grpo"
    }

    async fn train(&self, progress: &dyn ProgressSink) -> TrainingResult<TrainOutput> {
        if !self.is_cancelled() {
            self.set_status(TrainerStatus::Running);
        }
        match self.run_loop(progress).await {
            Ok(output) => {
                self.set_status(TrainerStatus::Finished);
                Ok(output)
            }
            Err(e @ TrainingError::Cancelled(_)) => Err(e),
            Err(e) => {
                self.set_status(TrainerStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn status(&self) -> TrainerStatus {
        self.status.lock().map(|s| s.clone()).unwrap_or(TrainerStatus::Idle)
    }

    fn cancel(&self) {
        self.set_status(TrainerStatus::Cancelled);
    }
}

/// Build the GRPO arguments from the training config and construct the trainer.
pub async fn create_grpo_trainer(
    model: ModelHandle,
    tokenizer: TokenizerHandle,
    reward_funcs: Vec<Box<dyn RewardFunction>>,
    training_config: &TrainingConfig,
    train_dataset: Vec<TrainingExample>,
) -> TrainingResult<GrpoTrainer> {
    info!("Creating GRPO config");
    let args = GrpoConfig::from_training_config(training_config).map_err(|e| {
        error!(error = %e, "Failed to create GRPO config");
        e
    })?;
    debug!(?args, "GRPO config created");

    info!(rewards = reward_funcs.len(), examples = train_dataset.len(), "Creating GRPO trainer");
    let trainer = GrpoTrainer::new(model, tokenizer, reward_funcs, args, train_dataset)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create GRPO trainer");
            e
        })?;
    info!(total_steps = trainer.total_steps(), "GRPO trainer created successfully");
    Ok(trainer)
}
