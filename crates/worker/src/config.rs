//! Worker configuration

use std::env;

use thiserror::Error;

/// Every 15 minutes, on the minute (sec min hour day month weekday)
pub const DEFAULT_INVARIANT_CHECK_CRON: &str = "0 */15 * * * *";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub invariant_check_cron: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let invariant_check_cron = env::var("INVARIANT_CHECK_CRON")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_INVARIANT_CHECK_CRON.to_string());

        Ok(Self {
            database_url,
            invariant_check_cron,
        })
    }
}
