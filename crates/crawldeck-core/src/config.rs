//! Selection configuration. Precedence: env `CRAWLDECK_*` > file (`CRAWLDECK_CONFIG`,
//! default `config/crawldeck[.toml]`) > built-in defaults.

use crate::fetcher::RetryPolicy;
use crate::filter::{SelectionFilter, DEFAULT_PLACEHOLDER_LABEL, DEFAULT_PREFERRED_MARKER};
use crate::persist::DEFAULT_SLOT;
use crate::reconciler::DEFAULT_CONFIRM_SCHEDULE_MS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/crawldeck";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Backend API root; profiles live under `{api_base_url}/profiles`.
    pub api_base_url: String,
    /// Ask the list endpoint for tokens. Tokens are never persisted either way.
    pub include_tokens: bool,
    pub request_timeout_secs: u64,
    /// Case-insensitive label marking draft profiles. Empty disables filtering.
    pub placeholder_label: String,
    /// Case-insensitive name marker preferred by the default heuristic.
    pub preferred_marker: String,
    pub fetch_attempts: u32,
    pub fetch_retry_delay_ms: u64,
    pub confirm_schedule_ms: Vec<u64>,
    pub storage_path: String,
    pub storage_slot: String,
    /// Console `watch` refresh period. 0 = mount once and only follow events.
    pub refresh_interval_secs: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api".to_string(),
            include_tokens: false,
            request_timeout_secs: 30,
            placeholder_label: DEFAULT_PLACEHOLDER_LABEL.to_string(),
            preferred_marker: DEFAULT_PREFERRED_MARKER.to_string(),
            fetch_attempts: 3,
            fetch_retry_delay_ms: 1000,
            confirm_schedule_ms: DEFAULT_CONFIRM_SCHEDULE_MS.to_vec(),
            storage_path: "./data/crawldeck_selection".to_string(),
            storage_slot: DEFAULT_SLOT.to_string(),
            refresh_interval_secs: 0,
        }
    }
}

impl SelectionConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("CRAWLDECK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&config_path)
    }

    /// Loads from `path` (extension optional; a missing file is fine) plus environment.
    pub fn load_from(path: &str) -> Result<Self, config::ConfigError> {
        let built = config::Config::builder()
            .set_default("api_base_url", "http://127.0.0.1:8000/api")?
            .set_default("storage_path", "./data/crawldeck_selection")?
            .set_default("storage_slot", DEFAULT_SLOT)?
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("CRAWLDECK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("confirm_schedule_ms"),
            )
            .build()?;

        built.try_deserialize()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.fetch_attempts,
            delay: Duration::from_millis(self.fetch_retry_delay_ms),
        }
    }

    pub fn confirm_schedule(&self) -> Vec<Duration> {
        self.confirm_schedule_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn filter(&self) -> SelectionFilter {
        SelectionFilter::new(&self.placeholder_label, &self.preferred_marker)
    }
}
