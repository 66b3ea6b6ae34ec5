use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

/// Filesystem layout of a training run under `output_dir`.
///
/// ```text
/// <output_dir>/
///   adapter/                  final adapter weights
///   tokenizer/                final tokenizer files
///   checkpoint-<step>/        adapter + tokenizer + trainer_state.json
///   trainer_state.json
///   dataset.jsonl
///   training_manifest.json
/// ```
#[derive(Debug, Clone)]
pub struct TrainingLayout {
    root: PathBuf,
}

impl TrainingLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn checkpoint_dir(&self, step: u64) -> PathBuf {
        self.root.join(format!("checkpoint-{step}"))
    }

    #[must_use]
    pub fn adapter_dir(&self) -> PathBuf {
        self.root.join("adapter")
    }

    #[must_use]
    pub fn tokenizer_dir(&self) -> PathBuf {
        self.root.join("tokenizer")
    }

    #[must_use]
    pub fn trainer_state_path(dir: &Path) -> PathBuf {
        dir.join("trainer_state.json")
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("training_manifest.json")
    }

    #[must_use]
    pub fn dataset_jsonl_path(&self) -> PathBuf {
        self.root.join("dataset.jsonl")
    }

    pub fn ensure_root(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Empties the final adapter and tokenizer directories, creating them if needed.
    pub fn reset_save_dirs(&self) -> TrainingResult<()> {
        for dir in [self.adapter_dir(), self.tokenizer_dir()] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Removes the outputs of a previous run's manifest stage.
    pub fn clear_manifest_outputs(&self) -> TrainingResult<()> {
        for path in [self.manifest_path(), self.dataset_jsonl_path()] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = TrainingLayout::new(temp.path().join("outputs"));

        assert!(layout.checkpoint_dir(50).ends_with("checkpoint-50"));
        assert!(layout.manifest_path().ends_with("training_manifest.json"));
        assert!(TrainingLayout::trainer_state_path(&layout.checkpoint_dir(1)).ends_with("checkpoint-1/trainer_state.json"));

        layout.ensure_root().unwrap();
        assert!(layout.root().is_dir());
    }

    #[test]
    fn test_reset_save_dirs_drops_stale_files() {
        let temp = TempDir::new().unwrap();
        let layout = TrainingLayout::new(temp.path());
        layout.reset_save_dirs().unwrap();
        std::fs::write(layout.adapter_dir().join("stale.bin"), b"old").unwrap();

        layout.reset_save_dirs().unwrap();
        assert!(layout.adapter_dir().is_dir());
        assert!(layout.tokenizer_dir().is_dir());
        assert_eq!(std::fs::read_dir(layout.adapter_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_manifest_outputs() {
        let temp = TempDir::new().unwrap();
        let layout = TrainingLayout::new(temp.path());
        std::fs::write(layout.manifest_path(), "{}").unwrap();
        std::fs::write(layout.dataset_jsonl_path(), "").unwrap();

        layout.clear_manifest_outputs().unwrap();
        assert!(!layout.manifest_path().exists());
        assert!(!layout.dataset_jsonl_path().exists());
        layout.clear_manifest_outputs().unwrap();
    }
}
