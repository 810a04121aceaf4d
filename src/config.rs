//! Board configuration.
//!
//! Defaults match the production kitchen display; each value can be
//! overridden through a `KDS_*` environment variable.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::api::normalize_api_host;
use crate::diagnostics;
use crate::error::BoardError;
use crate::fetcher::DateFilter;

pub const APP_SOURCE: &str = "kds_app";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_REJECT_WINDOW: Duration = Duration::from_secs(90);
pub const KEYRING_SERVICE: &str = "kds-board";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Production,
    Testing,
    Development,
}

impl Environment {
    pub fn api_host(self) -> &'static str {
        match self {
            Environment::Production => "https://ghanish.in",
            Environment::Testing | Environment::Development => "https://men4u.xyz",
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "testing" | "test" => Ok(Environment::Testing),
            "development" | "dev" => Ok(Environment::Development),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardConfig {
    pub environment: Environment,
    pub api_host: String,
    pub poll_interval: Duration,
    pub reject_window: Duration,
    pub app_source: String,
    pub data_dir: PathBuf,
    pub date_filter: DateFilter,
    pub keyring_service: String,
}

impl Default for BoardConfig {
    fn default() -> Self {
        let environment = Environment::default();
        Self {
            environment,
            api_host: environment.api_host().to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            reject_window: DEFAULT_REJECT_WINDOW,
            app_source: APP_SOURCE.to_string(),
            data_dir: diagnostics::default_data_dir(),
            date_filter: DateFilter::default(),
            keyring_service: KEYRING_SERVICE.to_string(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_secs(name: &str) -> Result<Option<Duration>, BoardError> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => match raw.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
            _ => Err(BoardError::Config(format!(
                "{name} must be a positive number of seconds, got {raw:?}"
            ))),
        },
    }
}

impl BoardConfig {
    /// Defaults with `KDS_*` overrides applied.
    pub fn from_env() -> Result<Self, BoardError> {
        let mut config = Self::default();

        if let Some(raw) = env_var("KDS_ENV") {
            config.environment = raw.parse().map_err(BoardError::Config)?;
            config.api_host = config.environment.api_host().to_string();
        }
        if let Some(host) = env_var("KDS_API_HOST") {
            config.api_host = normalize_api_host(&host);
        }
        if let Some(interval) = env_secs("KDS_POLL_INTERVAL_SECS")? {
            config.poll_interval = interval;
        }
        if let Some(window) = env_secs("KDS_REJECT_WINDOW_SECS")? {
            config.reject_window = window;
        }
        if let Some(dir) = env_var("KDS_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = env_var("KDS_DATE_FILTER") {
            config.date_filter = raw.parse().map_err(BoardError::Config)?;
        }

        info!(
            environment = ?config.environment,
            api_host = %config.api_host,
            poll_secs = config.poll_interval.as_secs(),
            "configuration loaded"
        );
        Ok(config)
    }
}
