use crate::dataset::{RawRecord, Split, TrainingExample};
use crate::error::{TrainingError, TrainingResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source of labeled question/answer records.
#[async_trait]
pub trait DatasetProvider: Send + Sync {
    fn id(&self) -> &'static str;

    async fn load_split(&self, split: Split) -> TrainingResult<Vec<RawRecord>>;
}

/// Reads `<dir>/<split>.jsonl`, the layout of the upstream grade-school-math repository.
#[derive(Debug, Clone)]
pub struct JsonlDatasetProvider {
    dir: PathBuf,
}

impl JsonlDatasetProvider {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn split_path(&self, split: Split) -> PathBuf {
        self.dir.join(format!("{split}.jsonl"))
    }
}

#[async_trait]
impl DatasetProvider for JsonlDatasetProvider {
    fn id(&self) -> &'static str {
        "jsonl"
    }

    async fn load_split(&self, split: Split) -> TrainingResult<Vec<RawRecord>> {
        let path = self.split_path(split);
        if !path.exists() {
            return Err(TrainingError::Dataset(format!(
                "GSM8K split not found: {}",
                path.display()
            )));
        }
        read_jsonl_records(&path)
    }
}

pub fn read_jsonl_records(path: &Path) -> TrainingResult<Vec<RawRecord>> {
    let contents = std::fs::read_to_string(path)?;
    let mut records = Vec::new();

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: RawRecord = serde_json::from_str(line).map_err(|e| {
            TrainingError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e))
        })?;
        records.push(record);
    }

    debug!(path = %path.display(), records = records.len(), "read jsonl records");
    Ok(records)
}

pub fn write_jsonl_dataset(path: &Path, examples: &[TrainingExample]) -> TrainingResult<()> {
    let mut out = String::new();
    for ex in examples {
        out.push_str(&serde_json::to_string(ex)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::get_gsm8k_questions;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_jsonl_provider_reads_split_and_skips_blank_lines() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("train.jsonl"),
            concat!(
                r#"{"question": "Janet has 3 apples and buys 2. How many?", "answer": "3 + 2 = 5\n#### 5"}"#,
                "\n\n",
                r#"{"question": "What is 6 x 7?", "answer": "6 x 7 = 42\n#### 42"}"#,
                "\n"
            ),
        )
        .unwrap();

        let provider = JsonlDatasetProvider::new(temp.path());
        let examples = get_gsm8k_questions(&provider, Split::Train).await.unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[1].answer.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_jsonl_provider_missing_split_is_dataset_error() {
        let temp = TempDir::new().unwrap();
        let provider = JsonlDatasetProvider::new(temp.path());
        let err = get_gsm8k_questions(&provider, Split::Test).await.unwrap_err();
        assert!(matches!(err, TrainingError::Dataset(_)));
    }

    #[test]
    fn test_read_jsonl_reports_line_number() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.jsonl");
        std::fs::write(&path, "{\"question\": \"q\", \"answer\": \"a\"}\nnot json\n").unwrap();
        let err = read_jsonl_records(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_write_jsonl_dataset_one_line_per_example() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dataset.jsonl");
        let examples = vec![
            TrainingExample::from_record(RawRecord { question: "q1".into(), answer: "#### 1".into() }),
            TrainingExample::from_record(RawRecord { question: "q2".into(), answer: "#### 2".into() }),
        ];
        write_jsonl_dataset(&path, &examples).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 2);
    }
}
