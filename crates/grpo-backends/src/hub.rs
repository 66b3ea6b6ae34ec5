//! GSM8K rows fetched from the Hugging Face datasets-server.

use async_trait::async_trait;
use grpo_training::{DatasetProvider, RawRecord, Split, TrainingError, TrainingResult};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Maximum page size accepted by the `/rows` endpoint.
pub const ROWS_PAGE_SIZE: usize = 100;

/// Dataset provider backed by the datasets-server `/rows` API.
#[derive(Debug, Clone)]
pub struct HubDatasetProvider {
    base_url: String,
    dataset: String,
    config: String,
    client: Client,
}

#[derive(Deserialize)]
struct RowsResponse {
    rows: Vec<RowEntry>,
    num_rows_total: usize,
}

#[derive(Deserialize)]
struct RowEntry {
    row: RawRecord,
}

impl HubDatasetProvider {
    /// Creates a provider for `dataset`/`config` with a per-request timeout.
    ///
    /// # Errors
    /// Returns a `Dataset` error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        dataset: impl Into<String>,
        config: impl Into<String>,
        timeout: Duration,
    ) -> TrainingResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrainingError::Dataset(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            dataset: dataset.into(),
            config: config.into(),
            client,
        })
    }

    async fn fetch_page(&self, split: Split, offset: usize) -> TrainingResult<RowsResponse> {
        let url = format!("{}/rows", self.base_url);
        let offset_param = offset.to_string();
        let length_param = ROWS_PAGE_SIZE.to_string();
        debug!(url = %url, split = %split, offset, "fetching dataset rows");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("dataset", self.dataset.as_str()),
                ("config", self.config.as_str()),
                ("split", split.as_str()),
                ("offset", offset_param.as_str()),
                ("length", length_param.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                debug!(error = %e, base_url = %self.base_url, "dataset hub request failed");
                if e.is_connect() || e.is_timeout() {
                    TrainingError::Connection(format!("dataset hub not reachable at {}: {e}", self.base_url))
                } else {
                    TrainingError::Dataset(format!("network error: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            debug!(status = %status, error = %error_text, dataset = %self.dataset, "dataset hub returned error status");
            return Err(TrainingError::Dataset(format!(
                "{} split '{split}' unavailable ({status}): {error_text}",
                self.dataset
            )));
        }

        response.json::<RowsResponse>().await.map_err(|e| {
            debug!(error = %e, "dataset rows did not parse");
            TrainingError::Dataset(format!("malformed rows response: {e}"))
        })
    }
}

#[async_trait]
impl DatasetProvider for HubDatasetProvider {
    fn id(&self) -> &'static str {
        "hub"
    }

    async fn load_split(&self, split: Split) -> TrainingResult<Vec<RawRecord>> {
        let mut records = Vec::new();
        loop {
            let page = self.fetch_page(split, records.len()).await?;
            let fetched = page.rows.len();
            records.extend(page.rows.into_iter().map(|entry| entry.row));
            if fetched == 0 || records.len() >= page.num_rows_total {
                break;
            }
        }
        info!(dataset = %self.dataset, split = %split, rows = records.len(), "Loaded dataset split");
        Ok(records)
    }
}
