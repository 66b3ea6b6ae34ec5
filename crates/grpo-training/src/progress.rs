use crate::trainer::LogEntry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { total_steps: u64 },
    Step { step: u64, total: u64, metrics: LogEntry },
    Checkpoint { step: u64, path: PathBuf },
    Finished { global_step: u64 },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Forwards progress to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { total_steps } => info!(total_steps, "training started"),
            ProgressEvent::Step { step, total, metrics } => info!(
                step,
                total,
                epoch = metrics.epoch,
                loss = metrics.loss,
                reward = metrics.reward,
                reward_std = metrics.reward_std,
                learning_rate = metrics.learning_rate,
                completion_length = metrics.completion_length,
                "step {step}/{total}"
            ),
            ProgressEvent::Checkpoint { step, path } => {
                info!(step, path = %path.display(), "checkpoint saved");
            }
            ProgressEvent::Finished { global_step } => info!(global_step, "training finished"),
        }
    }
}
