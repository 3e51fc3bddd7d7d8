// =============================================================================
// Runtime Configuration — pipeline settings with atomic save
// =============================================================================
//
// Every tunable of the fetch / clean / persist / stream pipeline lives here.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// The API key is not part of this struct: it is read from the environment
// only and never written to disk.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::preprocess::{CoercionPolicy, DEFAULT_OUTLIER_THRESHOLD};
use crate::polygon::client::{DEFAULT_BASE_URL, MAX_PAGE_LIMIT};
use crate::polygon::socket::DEFAULT_STREAM_URL;
use crate::types::{AggregateRequest, Timespan};

/// Environment variable holding the provider API key.
pub const API_KEY_ENV: &str = "POLYGON_API_KEY";
/// Comma-separated symbol list overriding the config file.
pub const SYMBOLS_ENV: &str = "PIPELINE_SYMBOLS";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["AAPL".to_string(), "MSFT".to_string()]
}

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or_default()
}

fn default_end_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default()
}

fn default_multiplier() -> u32 {
    1
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_rest_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_stream_url() -> String {
    DEFAULT_STREAM_URL.to_string()
}

fn default_page_limit() -> u32 {
    MAX_PAGE_LIMIT
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_outlier_threshold() -> f64 {
    DEFAULT_OUTLIER_THRESHOLD
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Historical query ----------------------------------------------------

    /// Tickers processed in order, one at a time.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// First calendar day of the range (inclusive).
    #[serde(default = "default_start_date")]
    pub start_date: NaiveDate,

    /// Last calendar day of the range (inclusive).
    #[serde(default = "default_end_date")]
    pub end_date: NaiveDate,

    #[serde(default)]
    pub timespan: Timespan,

    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Split/dividend adjusted prices.
    #[serde(default = "default_true")]
    pub adjusted: bool,

    // --- Provider ------------------------------------------------------------

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// Rows per aggregates page (provider maximum 50 000).
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // --- Cleaning --------------------------------------------------------------

    /// |daily_return| above this is logged as a potential anomaly.
    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold: f64,

    /// What to do with price/volume cells that are not numbers.
    #[serde(default)]
    pub coercion_policy: CoercionPolicy,

    // --- Storage ---------------------------------------------------------------

    /// Directory processed files are written to.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Re-load each saved file and compare its shape.
    #[serde(default = "default_true")]
    pub verify_after_save: bool,

    // --- Streaming -------------------------------------------------------------

    /// Ticks retained per symbol; `null` (the default) keeps everything.
    #[serde(default)]
    pub stream_buffer_capacity: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            start_date: default_start_date(),
            end_date: default_end_date(),
            timespan: Timespan::default(),
            multiplier: default_multiplier(),
            adjusted: true,
            rest_base_url: default_rest_base_url(),
            stream_url: default_stream_url(),
            page_limit: default_page_limit(),
            request_timeout_secs: default_request_timeout_secs(),
            outlier_threshold: default_outlier_threshold(),
            coercion_policy: CoercionPolicy::default(),
            data_dir: default_data_dir(),
            verify_after_save: true,
            stream_buffer_capacity: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            start = %config.start_date,
            end = %config.end_date,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise pipeline config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "pipeline config saved (atomic)");
        Ok(())
    }

    /// Replace the symbol list from a comma-separated string. Blank entries
    /// are ignored; an entirely blank string leaves the list untouched.
    pub fn override_symbols(&mut self, raw: &str) {
        let symbols: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !symbols.is_empty() {
            self.symbols = symbols;
        }
    }

    /// The historical query for one symbol under this configuration.
    pub fn request_for(&self, symbol: &str) -> AggregateRequest {
        AggregateRequest::new(symbol, self.start_date, self.end_date)
            .with_interval(self.multiplier, self.timespan)
            .with_adjusted(self.adjusted)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Read the provider API key from the environment. Missing or blank is an
/// error: nothing in the pipeline can run without it.
pub fn api_key_from_env() -> Result<String> {
    let key = std::env::var(API_KEY_ENV)
        .with_context(|| format!("{API_KEY_ENV} is not set (add it to the environment or .env)"))?;
    let key = key.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("{API_KEY_ENV} is empty");
    }
    Ok(key)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols, vec!["AAPL", "MSFT"]);
        assert_eq!(cfg.start_date, NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
        assert_eq!(cfg.end_date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(cfg.timespan, Timespan::Day);
        assert_eq!(cfg.multiplier, 1);
        assert!(cfg.adjusted);
        assert_eq!(cfg.page_limit, 50_000);
        assert_eq!(cfg.coercion_policy, CoercionPolicy::ZeroColumn);
        assert_eq!(cfg.stream_buffer_capacity, None);
        assert!((cfg.outlier_threshold - 0.15).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "symbols": ["TSLA"],
            "start_date": "2022-06-01",
            "timespan": "hour",
            "multiplier": 4,
            "coercion_policy": "drop_rows",
            "stream_buffer_capacity": 500
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["TSLA"]);
        assert_eq!(cfg.start_date, NaiveDate::from_ymd_opt(2022, 6, 1).unwrap());
        assert_eq!(cfg.timespan, Timespan::Hour);
        assert_eq!(cfg.coercion_policy, CoercionPolicy::DropRows);
        assert_eq!(cfg.stream_buffer_capacity, Some(500));
        assert_eq!(cfg.data_dir, "data");

        let req = cfg.request_for("TSLA");
        assert_eq!(req.interval_label(), "4hour");
        assert!(req.adjusted);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline_config.json");
        let mut cfg = RuntimeConfig::default();
        cfg.adjusted = false;
        cfg.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(RuntimeConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RuntimeConfig::load(dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn symbol_override_normalises_input() {
        let mut cfg = RuntimeConfig::default();
        cfg.override_symbols(" nvda, ,amd ");
        assert_eq!(cfg.symbols, vec!["NVDA", "AMD"]);
        cfg.override_symbols(" , ");
        assert_eq!(cfg.symbols, vec!["NVDA", "AMD"]);
    }
}
