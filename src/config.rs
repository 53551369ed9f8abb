use crate::errors::{AppError, AppResult};
use crate::generator::{GeneratorPolicy, DEFAULT_LOOKAHEAD_DAYS};
use crate::models::SubjectType;
use crate::retry::RetryPolicy;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIN_REFRESH_SECS: u64 = 1;
const MAX_LOOKAHEAD_DAYS: u32 = 90;
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;
const MAX_RETRIES_ALLOWED: u32 = 10;

pub const ENV_DATA_DIR: &str = "BIZDASH_DATA_DIR";
pub const ENV_STORE: &str = "BIZDASH_STORE";
pub const ENV_REFRESH_SECS: &str = "BIZDASH_REFRESH_SECS";
pub const ENV_LOOKAHEAD_DAYS: &str = "BIZDASH_LOOKAHEAD_DAYS";
pub const ENV_UTC_OFFSET_MINUTES: &str = "BIZDASH_UTC_OFFSET_MINUTES";
pub const ENV_LOG: &str = "BIZDASH_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl StoreBackend {
    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(AppError::Validation(format!(
                "unknown store backend '{}': expected memory or sqlite",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardConfig {
    pub data_dir: PathBuf,
    pub store: StoreBackend,
    pub refresh_secs: u64,
    pub lookahead_days: u32,
    pub utc_offset_minutes: i32,
    pub subject_types: Vec<SubjectType>,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub log_filter: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".bizdash"),
            store: StoreBackend::Sqlite,
            refresh_secs: 30,
            lookahead_days: DEFAULT_LOOKAHEAD_DAYS,
            utc_offset_minutes: 0,
            subject_types: SubjectType::ALL.to_vec(),
            max_retries: 3,
            retry_backoff_ms: 200,
            log_filter: "info".to_string(),
        }
    }
}

impl DashboardConfig {
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Io(format!("failed to read config '{}': {}", path.display(), err)))?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> AppResult<()> {
        if let Some(value) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_STORE) {
            self.store = StoreBackend::parse(&value)?;
        }
        if let Some(value) = lookup(ENV_REFRESH_SECS) {
            self.refresh_secs = parse_number(ENV_REFRESH_SECS, &value)?;
        }
        if let Some(value) = lookup(ENV_LOOKAHEAD_DAYS) {
            self.lookahead_days = parse_number(ENV_LOOKAHEAD_DAYS, &value)?;
        }
        if let Some(value) = lookup(ENV_UTC_OFFSET_MINUTES) {
            self.utc_offset_minutes = parse_number(ENV_UTC_OFFSET_MINUTES, &value)?;
        }
        if let Some(value) = lookup(ENV_LOG) {
            self.log_filter = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.refresh_secs < MIN_REFRESH_SECS {
            return Err(AppError::Validation(format!(
                "refreshSecs must be at least {}",
                MIN_REFRESH_SECS
            )));
        }
        if self.lookahead_days > MAX_LOOKAHEAD_DAYS {
            return Err(AppError::Validation(format!(
                "lookaheadDays must be between 0 and {}",
                MAX_LOOKAHEAD_DAYS
            )));
        }
        if self.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(AppError::Validation(format!(
                "utcOffsetMinutes must be within ±{}",
                MAX_UTC_OFFSET_MINUTES
            )));
        }
        if self.subject_types.is_empty() {
            return Err(AppError::Validation("subjectTypes cannot be empty".to_string()));
        }
        if self.max_retries > MAX_RETRIES_ALLOWED {
            return Err(AppError::Validation(format!(
                "maxRetries must be at most {}",
                MAX_RETRIES_ALLOWED
            )));
        }
        if self.log_filter.trim().is_empty() {
            return Err(AppError::Validation("logFilter cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("dashboard.sqlite")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    pub fn utc_offset(&self) -> AppResult<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            AppError::Validation(format!("invalid utc offset {} minutes", self.utc_offset_minutes))
        })
    }

    pub fn generator_policy(&self) -> AppResult<GeneratorPolicy> {
        Ok(GeneratorPolicy {
            lookahead_days: self.lookahead_days,
            subject_types: self.subject_types.iter().copied().collect(),
            utc_offset: self.utc_offset()?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_ms: self.retry_backoff_ms,
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> AppResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| AppError::Validation(format!("{} must be a number, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_fills_only_given_fields() {
        let config = DashboardConfig::from_yaml_str(
            "dataDir: /var/lib/bizdash\nstore: memory\nlookaheadDays: 14\nsubjectTypes: [installment, delivery]\n",
        )
        .expect("config");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/bizdash"));
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.lookahead_days, 14);
        assert_eq!(config.refresh_secs, 30);
        assert_eq!(config.subject_types.len(), 2);
        assert_eq!(config.sqlite_path(), PathBuf::from("/var/lib/bizdash/dashboard.sqlite"));
    }

    #[test]
    fn env_overrides_win_and_are_validated() {
        let env: HashMap<&str, &str> = [
            (ENV_STORE, "SQLITE"),
            (ENV_REFRESH_SECS, "5"),
            (ENV_UTC_OFFSET_MINUTES, "-300"),
        ]
        .into_iter()
        .collect();
        let mut config = DashboardConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|value| value.to_string()))
            .expect("overrides");
        config.validate().expect("valid");
        assert_eq!(config.refresh_interval(), Duration::from_secs(5));
        assert_eq!(config.utc_offset().expect("offset").local_minus_utc(), -300 * 60);

        let mut bad = DashboardConfig::default();
        let result = bad.apply_overrides(|key| (key == ENV_LOOKAHEAD_DAYS).then(|| "soon".to_string()));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut config = DashboardConfig {
            lookahead_days: 120,
            ..DashboardConfig::default()
        };
        assert!(config.validate().is_err());
        config.lookahead_days = 7;
        config.refresh_secs = 0;
        assert!(config.validate().is_err());
        config.refresh_secs = 30;
        config.utc_offset_minutes = 15 * 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_yaml_store_is_a_validation_error() {
        let result = DashboardConfig::from_yaml_str("store: postgres\n");
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
