use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::stats::DEFAULT_PAGE_LIMIT;

/// Shortest generated code we accept from configuration.
pub const MIN_CODE_LENGTH: usize = 4;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding urls.csv, clicks.csv, user-agents.csv, stats.csv and users.csv
    pub data_dir: PathBuf,

    /// Public base URL used when building short links, e.g. "https://go.example.com".
    /// Must NOT have a trailing slash.
    pub base_url: String,

    /// Prefix of the JSON API, used for hypermedia links in stats responses.
    /// Must NOT have a trailing slash.
    pub api_base: String,

    /// Length of generated short codes
    pub short_code_length: usize,

    /// How many random codes to try before giving up
    pub short_code_max_attempts: u32,

    /// Default page size of the daily stats series
    pub stats_page_limit: usize,
}

impl StoreConfig {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            base_url: "http://localhost:3000".into(),
            api_base: "/api".into(),
            short_code_length: 6,
            short_code_max_attempts: 100,
            stats_page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    /// Load configuration from environment variables (populated by dotenvy before this is called).
    pub fn from_env() -> Result<Self> {
        let defaults = Self::new(
            std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()),
        );

        let short_code_length = std::env::var("SHORT_CODE_LENGTH")
            .unwrap_or_else(|_| defaults.short_code_length.to_string())
            .parse::<usize>()
            .context("SHORT_CODE_LENGTH must be a positive integer")?;

        if short_code_length < MIN_CODE_LENGTH {
            anyhow::bail!("SHORT_CODE_LENGTH must be at least {MIN_CODE_LENGTH}");
        }

        let short_code_max_attempts = std::env::var("SHORT_CODE_MAX_ATTEMPTS")
            .unwrap_or_else(|_| defaults.short_code_max_attempts.to_string())
            .parse::<u32>()
            .context("SHORT_CODE_MAX_ATTEMPTS must be a positive integer")?;

        let stats_page_limit = std::env::var("STATS_PAGE_LIMIT")
            .unwrap_or_else(|_| defaults.stats_page_limit.to_string())
            .parse::<usize>()
            .context("STATS_PAGE_LIMIT must be a positive integer")?;

        if stats_page_limit == 0 {
            anyhow::bail!("STATS_PAGE_LIMIT must not be 0");
        }

        let base_url = std::env::var("BASE_URL")
            .unwrap_or_else(|_| defaults.base_url.clone())
            .trim_end_matches('/')
            .to_owned();

        let api_base = std::env::var("API_BASE")
            .unwrap_or_else(|_| defaults.api_base.clone())
            .trim_end_matches('/')
            .to_owned();

        Ok(Self {
            base_url,
            api_base,
            short_code_length,
            short_code_max_attempts,
            stats_page_limit,
            ..defaults
        })
    }
}
