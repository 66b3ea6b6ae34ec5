use crate::error::{TrainingError, TrainingResult};
use crate::provider::DatasetProvider;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{debug, error, info};

/// System prompt that asks the model for a reasoning block followed by an answer block.
pub const SYSTEM_PROMPT: &str = "
Respond in the following format:
<reasoning>
...
</reasoning>
<answer>
...
</answer>
";

/// Delimiter between the worked solution and the final answer in GSM8K.
pub const ANSWER_DELIMITER: &str = "####";

pub const DEFAULT_HUB_DATASET: &str = "openai/gsm8k";
pub const DEFAULT_HUB_CONFIG: &str = "main";
pub const DEFAULT_HUB_URL: &str = "https://datasets-server.huggingface.co";
/// Per-request timeout for the datasets-server.
pub const DEFAULT_HUB_TIMEOUT_SECS: u64 = 60;

/// Stable identifier for a dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// A GSM8K record as published: a word problem and its worked solution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub question: String,
    pub answer: String,
}

/// A single prompt for GRPO training.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub prompt: Vec<Message>,
    /// Reference answer, absent when the solution carried no `####` delimiter.
    pub answer: Option<String>,
}

impl TrainingExample {
    pub fn from_record(record: RawRecord) -> Self {
        let answer = extract_hash_answer(&record.answer);
        Self {
            prompt: vec![Message::system(SYSTEM_PROMPT), Message::user(record.question)],
            answer,
        }
    }

    /// The user turn of the prompt (the word problem).
    pub fn question(&self) -> Option<&str> {
        self.prompt
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Test,
}

impl Split {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where GSM8K records come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DatasetSource {
    /// Hugging Face datasets-server rows API.
    Hub {
        #[serde(default = "default_hub_dataset")]
        dataset: String,
        #[serde(default = "default_hub_config")]
        config: String,
        #[serde(default = "default_hub_url")]
        base_url: String,
        #[serde(default = "default_hub_timeout_secs")]
        timeout_secs: u64,
    },
    /// A directory holding `train.jsonl` and `test.jsonl`.
    Jsonl { dir: PathBuf },
}

impl Default for DatasetSource {
    fn default() -> Self {
        Self::Hub {
            dataset: default_hub_dataset(),
            config: default_hub_config(),
            base_url: default_hub_url(),
            timeout_secs: default_hub_timeout_secs(),
        }
    }
}

fn default_hub_dataset() -> String {
    DEFAULT_HUB_DATASET.to_string()
}

fn default_hub_config() -> String {
    DEFAULT_HUB_CONFIG.to_string()
}

fn default_hub_url() -> String {
    DEFAULT_HUB_URL.to_string()
}

const fn default_hub_timeout_secs() -> u64 {
    DEFAULT_HUB_TIMEOUT_SECS
}

/// Pull the final answer out of a GSM8K solution.
///
/// Returns the trimmed text between the first `####` and the next one (or the end of
/// the text), and `None` when the delimiter is absent.
pub fn extract_hash_answer(text: &str) -> Option<String> {
    let answer = text.split(ANSWER_DELIMITER).nth(1).map(|s| s.trim().to_string());
    match &answer {
        Some(a) => debug!(answer = %a, "extracted reference answer"),
        None => debug!("'####' not found in solution text"),
    }
    answer
}

/// Load a GSM8K split and map every record into a chat prompt plus reference answer.
pub async fn get_gsm8k_questions(
    provider: &dyn DatasetProvider,
    split: Split,
) -> TrainingResult<Vec<TrainingExample>> {
    info!(provider = provider.id(), split = %split, "Loading dataset split");

    let records = match provider.load_split(split).await {
        Ok(records) => records,
        Err(e @ TrainingError::Connection(_)) => {
            error!(error = %e, split = %split, "Failed to load dataset due to a connection error");
            return Err(e);
        }
        Err(e) => {
            error!(error = %e, split = %split, "Unexpected error while loading the dataset");
            return Err(match e {
                TrainingError::Dataset(msg) => TrainingError::Dataset(msg),
                other => TrainingError::Dataset(other.to_string()),
            });
        }
    };
    info!(split = %split, records = records.len(), "Dataset loaded successfully");

    let examples: Vec<TrainingExample> =
        records.into_iter().map(TrainingExample::from_record).collect();
    debug!(split = %split, examples = examples.len(), "Dataset mapping complete");
    Ok(examples)
}

pub fn compute_dataset_id(examples: &[TrainingExample]) -> TrainingResult<DatasetId> {
    let mut hasher = Sha256::new();

    for ex in examples {
        let bytes = serde_json::to_vec(ex)?;
        hasher.update(bytes);
        hasher.update(b"\n");
    }

    Ok(DatasetId(hex::encode(hasher.finalize())))
}

pub fn validate_examples(examples: &[TrainingExample]) -> TrainingResult<()> {
    if examples.is_empty() {
        return Err(TrainingError::Dataset("dataset must not be empty".to_string()));
    }
    for (idx, ex) in examples.iter().enumerate() {
        if ex.question().is_none_or(|q| q.trim().is_empty()) {
            return Err(TrainingError::Dataset(format!("example[{idx}] question is empty")));
        }
    }
    Ok(())
}
