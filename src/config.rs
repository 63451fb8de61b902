//! Engine configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration. `PAPER_DB_PATH` and `PAPER_SWEEP_SECS` override the file.

use crate::error::{PaperError, Result};
use crate::finance::commission::FeeSchedule;
use crate::finance::constants::{
    DEFAULT_QUOTE_TTL_SECS, DEFAULT_SWEEP_INTERVAL_SECS, LIMIT_ORDER_MAX_AGE_DAYS,
    QUEUED_ORDER_MAX_AGE_DAYS,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DB_PATH: &str = "PAPER_DB_PATH";
pub const ENV_SWEEP_SECS: &str = "PAPER_SWEEP_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Seconds between scheduled sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Lifetime of cached quotes used for display and trigger checks
    #[serde(default = "default_quote_ttl")]
    pub quote_ttl_secs: u64,

    #[serde(default)]
    pub risk_free_rate: f64,

    #[serde(default)]
    pub fees: FeeSchedule,

    /// Only evaluate limit triggers during the regular session
    #[serde(default)]
    pub limit_orders_require_open_market: bool,

    /// Keep sweeping on schedule while the market is closed
    #[serde(default)]
    pub sweep_when_closed: bool,

    #[serde(default)]
    pub calendar: CalendarConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Years the exchange calendar is trusted for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default = "default_first_year")]
    pub first_year: i32,
    #[serde(default = "default_last_year")]
    pub last_year: i32,
}

/// Age limits after which pending orders are cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_queued_max_age")]
    pub queued_max_age_days: i64,
    #[serde(default = "default_limit_max_age")]
    pub limit_max_age_days: i64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("paper.db")
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_quote_ttl() -> u64 {
    DEFAULT_QUOTE_TTL_SECS
}

fn default_first_year() -> i32 {
    2020
}

fn default_last_year() -> i32 {
    2035
}

fn default_queued_max_age() -> i64 {
    QUEUED_ORDER_MAX_AGE_DAYS
}

fn default_limit_max_age() -> i64 {
    LIMIT_ORDER_MAX_AGE_DAYS
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            first_year: default_first_year(),
            last_year: default_last_year(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            queued_max_age_days: default_queued_max_age(),
            limit_max_age_days: default_limit_max_age(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            sweep_interval_secs: default_sweep_interval(),
            quote_ttl_secs: default_quote_ttl(),
            risk_free_rate: 0.0,
            fees: FeeSchedule::default(),
            limit_orders_require_open_market: false,
            sweep_when_closed: false,
            calendar: CalendarConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)
            .map_err(|e| PaperError::ConfigError(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            PaperError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env()?;
        Ok(config)
    }

    /// `load(path)` when a path is given, defaults plus environment otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Self::default();
                config.apply_env()?;
                Ok(config)
            }
        }
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(env::var(ENV_DB_PATH).ok(), env::var(ENV_SWEEP_SECS).ok())
    }

    fn apply_overrides(&mut self, db_path: Option<String>, sweep_secs: Option<String>) -> Result<()> {
        if let Some(path) = db_path {
            log::debug!("{} overrides db_path with {}", ENV_DB_PATH, path);
            self.db_path = PathBuf::from(path);
        }
        if let Some(secs) = sweep_secs {
            self.sweep_interval_secs = secs.trim().parse().map_err(|_| {
                PaperError::ConfigError(format!("{} must be a number of seconds, got {:?}", ENV_SWEEP_SECS, secs))
            })?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            return Err(PaperError::ConfigError(
                "sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.calendar.first_year > self.calendar.last_year {
            return Err(PaperError::ConfigError(format!(
                "calendar years out of order: {} > {}",
                self.calendar.first_year, self.calendar.last_year
            )));
        }
        if self.cleanup.queued_max_age_days <= 0 || self.cleanup.limit_max_age_days <= 0 {
            return Err(PaperError::ConfigError(
                "cleanup ages must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn quote_ttl(&self) -> Duration {
        Duration::from_secs(self.quote_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.sweep_interval(), Duration::from_secs(180));
        assert_eq!(config.quote_ttl(), Duration::from_secs(15));
        assert_eq!(config.cleanup.queued_max_age_days, 7);
        assert_eq!(config.cleanup.limit_max_age_days, 90);
    }

    #[test]
    fn test_parse_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            db_path = "/tmp/league.db"
            sweep_interval_secs = 60
            limit_orders_require_open_market = true

            [fees]
            per_trade = "1.00"
            pct_of_notional = "0.001"

            [calendar]
            first_year = 2024
            last_year = 2026
            "#,
        )
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/league.db"));
        assert_eq!(config.sweep_interval_secs, 60);
        assert!(config.limit_orders_require_open_market);
        assert_eq!(config.fees.per_trade, dec!(1.00));
        assert_eq!(config.calendar.first_year, 2024);
        assert_eq!(config.cleanup, CleanupConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            EngineConfig::from_toml_str("sweep_interval_secs = 0"),
            Err(PaperError::ConfigError(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[calendar]\nfirst_year = 2030\nlast_year = 2020"),
            Err(PaperError::ConfigError(_))
        ));
        assert!(EngineConfig::from_toml_str("sweep_interval_secs = \"fast\"").is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(Some("other.db".to_string()), Some(" 30 ".to_string()))
            .unwrap();
        assert_eq!(config.db_path, PathBuf::from("other.db"));
        assert_eq!(config.sweep_interval_secs, 30);

        let err = config.apply_overrides(None, Some("soon".to_string()));
        assert!(matches!(err, Err(PaperError::ConfigError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "quote_ttl_secs = 5").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.quote_ttl_secs, 5);

        let missing = EngineConfig::load(Path::new("/nonexistent/paper.toml"));
        assert!(matches!(missing, Err(PaperError::ConfigError(_))));
    }
}
