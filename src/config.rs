use std::time::Duration;

use crate::error::{Error, Result};
use crate::storage::repository;
use crate::storage::Database;
use crate::sync::{RetryPolicy, SchedulerConfig};

pub const ENV_API_URL: &str = "FLEETSYNC_API_URL";
pub const ENV_API_TOKEN: &str = "FLEETSYNC_API_TOKEN";

/// Keys accepted in `app_config`.
pub const CONFIG_KEYS: &[&str] = &[
    "api_base_url",
    "request_timeout_ms",
    "probe_interval_ms",
    "debounce_ms",
    "sync_interval_ms",
    "reference_refresh_interval_ms",
    "retry_max_attempts",
    "retry_base_delay_ms",
    "retry_max_delay_ms",
];

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub api_base_url: Option<String>,
    /// Only ever read from the environment; never stored.
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    pub probe_interval: Duration,
    pub debounce: Duration,
    pub sync_interval: Duration,
    pub reference_refresh_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            api_token: None,
            request_timeout: Duration::from_secs(15),
            probe_interval: Duration::from_secs(30),
            debounce: Duration::from_secs(2),
            sync_interval: Duration::from_secs(60),
            reference_refresh_interval: Duration::from_secs(6 * 3600),
            retry: RetryPolicy::default(),
        }
    }
}

fn millis(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| Error::Config(format!("{key} must be a number of milliseconds, got '{value}'")))
}

impl EngineConfig {
    /// Defaults, then `app_config` overrides, then the environment.
    pub async fn load(db: &Database) -> Result<Self> {
        let entries = db.read(|conn| repository::list_config(conn)).await?;
        let mut config = Self::from_entries(entries)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in entries {
            config.apply(&key, &value)?;
        }
        Ok(config)
    }

    /// Set one key from its stored string form.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "api_base_url" => {
                let value = value.trim();
                self.api_base_url = (!value.is_empty()).then(|| value.to_string());
            }
            "request_timeout_ms" => self.request_timeout = millis(key, value)?,
            "probe_interval_ms" => self.probe_interval = millis(key, value)?,
            "debounce_ms" => self.debounce = millis(key, value)?,
            "sync_interval_ms" => self.sync_interval = millis(key, value)?,
            "reference_refresh_interval_ms" => self.reference_refresh_interval = millis(key, value)?,
            "retry_max_attempts" => {
                self.retry.max_attempts = value.trim().parse().map_err(|_| {
                    Error::Config(format!("retry_max_attempts must be a whole number, got '{value}'"))
                })?;
            }
            "retry_base_delay_ms" => self.retry.base_delay = millis(key, value)?,
            "retry_max_delay_ms" => self.retry.max_delay = millis(key, value)?,
            other => {
                return Err(Error::Config(format!(
                    "unknown config key '{other}' (known: {})",
                    CONFIG_KEYS.join(", ")
                )))
            }
        }
        if self.request_timeout.is_zero() || self.sync_interval.is_zero() {
            return Err(Error::Config(format!("{key} must be greater than zero")));
        }
        Ok(())
    }

    /// Check a key/value pair without keeping it.
    pub fn validate(key: &str, value: &str) -> Result<()> {
        Self::default().apply(key, value)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = Some(url.trim().to_string());
        }
        if let Some(token) = lookup(ENV_API_TOKEN).filter(|v| !v.trim().is_empty()) {
            self.api_token = Some(token.trim().to_string());
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            sync_interval: self.sync_interval,
            reference_refresh_interval: self.reference_refresh_interval,
            retry: self.retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Table;

    #[test]
    fn test_overrides_and_env() {
        let mut config = EngineConfig::from_entries([
            ("debounce_ms".to_string(), "750".to_string()),
            ("retry_max_attempts".to_string(), "8".to_string()),
            ("api_base_url".to_string(), "https://stored.example/api".to_string()),
        ])
        .unwrap();
        assert_eq!(config.debounce, Duration::from_millis(750));
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.sync_interval, EngineConfig::default().sync_interval);

        config.apply_env(|name| match name {
            ENV_API_URL => Some("https://env.example/api".into()),
            ENV_API_TOKEN => Some("secret".into()),
            _ => None,
        });
        assert_eq!(config.api_base_url.as_deref(), Some("https://env.example/api"));
        assert_eq!(config.api_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            EngineConfig::validate("debounce_ms", "soon"),
            Err(Error::Config(_))
        ));
        assert!(EngineConfig::validate("request_timeout_ms", "0").is_err());
        assert!(EngineConfig::validate("colour", "blue").is_err());
        assert!(EngineConfig::validate("probe_interval_ms", "1000").is_ok());
    }

    #[tokio::test]
    async fn test_load_reads_app_config() {
        let db = Database::open_memory().await.unwrap();
        db.write(&[Table::AppConfig], |conn| {
            repository::set_config(conn, "sync_interval_ms", "5000")
        })
        .await
        .unwrap();
        let config = EngineConfig::load(&db).await.unwrap();
        assert_eq!(config.sync_interval, Duration::from_secs(5));
    }
}
