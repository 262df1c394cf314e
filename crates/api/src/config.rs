//! API server configuration

use std::env;

use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Server settings, read once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooled) connection used for migrations
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    /// Bearer token required on admin and customer routes
    pub internal_api_token: String,
    pub run_migrations: bool,
    pub allowed_origins: Vec<String>,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let internal_api_token = required("INTERNAL_API_TOKEN")?;
        if internal_api_token.len() < 16 {
            return Err(ConfigError::Invalid {
                name: "INTERNAL_API_TOKEN",
                value: "<redacted, shorter than 16 characters>".to_string(),
            });
        }

        let run_migrations = match env::var("RUN_MIGRATIONS") {
            Ok(value) => parse_bool("RUN_MIGRATIONS", &value)?,
            Err(_) => true,
        };

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_direct_url: env::var("DATABASE_DIRECT_URL").ok(),
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string()),
            internal_api_token,
            run_migrations,
            allowed_origins,
        })
    }

    /// Settings for router tests; no database is contacted
    pub fn for_tests(internal_api_token: &str) -> Self {
        Self {
            database_url: "postgres://localhost/credmarket_test".to_string(),
            database_direct_url: None,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            internal_api_token: internal_api_token.to_string(),
            run_migrations: false,
            allowed_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for name in [
            "DATABASE_URL",
            "DATABASE_DIRECT_URL",
            "BIND_ADDRESS",
            "INTERNAL_API_TOKEN",
            "RUN_MIGRATIONS",
            "ALLOWED_ORIGINS",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/credmarket");
        env::set_var("INTERNAL_API_TOKEN", "0123456789abcdef0123");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert!(config.run_migrations);
        assert_eq!(config.allowed_origins.len(), 2);
        assert!(config.database_direct_url.is_none());
        clear();
    }

    #[test]
    #[serial]
    fn test_missing_token_fails_fast() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/credmarket");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("INTERNAL_API_TOKEN")));
        clear();
    }

    #[test]
    #[serial]
    fn test_short_token_rejected() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/credmarket");
        env::set_var("INTERNAL_API_TOKEN", "short");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { name: "INTERNAL_API_TOKEN", .. })
        ));
        clear();
    }

    #[test]
    #[serial]
    fn test_run_migrations_flag() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/credmarket");
        env::set_var("INTERNAL_API_TOKEN", "0123456789abcdef0123");

        env::set_var("RUN_MIGRATIONS", "false");
        assert!(!Config::from_env().unwrap().run_migrations);

        env::set_var("RUN_MIGRATIONS", "maybe");
        assert!(Config::from_env().is_err());
        clear();
    }
}
