//! Concrete backends for GRPO training.
//!
//! # Supported Backends
//!
//! - **HTTP**: policy model served by an out-of-process training server
//! - **Hub**: GSM8K rows from the Hugging Face datasets-server
//! - **JSONL**: GSM8K splits from local `train.jsonl` / `test.jsonl` files

pub mod http;
pub mod hub;

use grpo_training::{
    BackendSettings, DatasetProvider, DatasetSource, JsonlDatasetProvider, PolicyBackend, TrainingResult,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use http::HttpPolicyBackend;
pub use hub::HubDatasetProvider;

/// Creates the policy backend described by `settings`.
///
/// # Errors
/// Returns a `Backend` error if the HTTP client cannot be built.
pub fn policy_backend(settings: &BackendSettings) -> TrainingResult<Arc<dyn PolicyBackend>> {
    debug!(base_url = %settings.base_url, timeout_secs = settings.timeout_secs, "Creating policy backend");
    Ok(Arc::new(HttpPolicyBackend::from_settings(settings)?))
}

/// Creates the dataset provider for `source`.
///
/// # Errors
/// Returns a `Dataset` error if the hub HTTP client cannot be built.
pub fn dataset_provider(source: &DatasetSource) -> TrainingResult<Box<dyn DatasetProvider>> {
    match source {
        DatasetSource::Hub { dataset, config, base_url, timeout_secs } => {
            debug!(dataset = %dataset, config = %config, timeout_secs, "Creating hub dataset provider");
            let provider = HubDatasetProvider::new(
                base_url.clone(),
                dataset.clone(),
                config.clone(),
                Duration::from_secs(*timeout_secs),
            )?;
            Ok(Box::new(provider))
        }
        DatasetSource::Jsonl { dir } => {
            debug!(dir = %dir.display(), "Creating JSONL dataset provider");
            Ok(Box::new(JsonlDatasetProvider::new(dir.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_dataset_provider_selection() {
        assert_eq!(dataset_provider(&DatasetSource::default()).unwrap().id(), "hub");
        let jsonl = DatasetSource::Jsonl { dir: PathBuf::from("data") };
        assert_eq!(dataset_provider(&jsonl).unwrap().id(), "jsonl");
    }

    #[test]
    fn test_policy_backend_from_settings() {
        let settings = BackendSettings { base_url: "http://localhost:8000/".to_string(), timeout_secs: 30 };
        assert_eq!(policy_backend(&settings).unwrap().id(), "http");
    }
}
