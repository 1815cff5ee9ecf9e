use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// `postgres` (default) or `memory`
    pub store: String,
    pub mercadopago_api_url: String,
    pub automation_url: String,
    pub captcha_api_url: String,
    pub captcha_poll_attempts: u32,
    pub captcha_poll_interval_secs: u64,
    pub pix_expiration_minutes: i64,
    pub cors_origins: Vec<String>,
    /// Manual checks allowed per minute, across all callers
    pub check_rate_per_minute: u32,
    pub reconcile: ReconcileConfig,
}

/// Timing and concurrency knobs of the reconciliation pipeline
#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    pub poll_interval_secs: u64,
    pub inflight_cooldown_secs: u64,
    /// Age after which a persisted processing lock is considered abandoned
    pub lock_ceiling_secs: u64,
    pub max_concurrent_dispatches: usize,
    pub gateway_timeout_secs: u64,
    pub driver_timeout_secs: u64,
    pub driver_max_attempts: u32,
    pub driver_retry_backoff_secs: u64,
    pub bulk_retry_delay_ms: u64,
    pub audit_sweep_interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            inflight_cooldown_secs: 5,
            lock_ceiling_secs: 180,
            max_concurrent_dispatches: 3,
            gateway_timeout_secs: 30,
            driver_timeout_secs: 90,
            driver_max_attempts: 3,
            driver_retry_backoff_secs: 10,
            bulk_retry_delay_ms: 1000,
            audit_sweep_interval_secs: 3600,
        }
    }
}

impl ReconcileConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn inflight_cooldown(&self) -> Duration {
        Duration::from_secs(self.inflight_cooldown_secs)
    }

    pub fn lock_ceiling(&self) -> Duration {
        Duration::from_secs(self.lock_ceiling_secs)
    }

    /// How often a running dispatch refreshes its lock; well inside the ceiling
    pub fn lock_heartbeat(&self) -> Duration {
        (self.lock_ceiling() / 3).max(Duration::from_millis(50))
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    /// Hard ceiling for one full driver call including its internal retries
    pub fn driver_budget(&self) -> Duration {
        let attempts = self.driver_max_attempts.max(1) as u64;
        Duration::from_secs(
            self.driver_timeout_secs * attempts + self.driver_retry_backoff_secs * (attempts - 1),
        )
    }

    /// Longest a single poller dispatch can take, cool-down included
    pub fn dispatch_grace(&self) -> Duration {
        self.gateway_timeout() + self.driver_budget() + self.inflight_cooldown()
    }

    pub fn bulk_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bulk_retry_delay_ms)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let defaults = ReconcileConfig::default();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/recarga".to_string()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            store: std::env::var("STORE").unwrap_or_else(|_| "postgres".to_string()),
            mercadopago_api_url: std::env::var("MERCADOPAGO_API_URL")
                .unwrap_or_else(|_| "https://api.mercadopago.com".to_string()),
            automation_url: std::env::var("AUTOMATION_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3100".to_string()),
            captcha_api_url: std::env::var("CAPTCHA_API_URL")
                .unwrap_or_else(|_| "https://2captcha.com".to_string()),
            captcha_poll_attempts: env_or("CAPTCHA_POLL_ATTEMPTS", 24)?,
            captcha_poll_interval_secs: env_or("CAPTCHA_POLL_INTERVAL_SECS", 5)?,
            pix_expiration_minutes: env_or("PIX_EXPIRATION_MINUTES", 30)?,
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            check_rate_per_minute: env_or("CHECK_RATE_PER_MINUTE", 30)?,
            reconcile: ReconcileConfig {
                poll_interval_secs: env_or("POLL_INTERVAL_SECS", defaults.poll_interval_secs)?,
                inflight_cooldown_secs: env_or(
                    "INFLIGHT_COOLDOWN_SECS",
                    defaults.inflight_cooldown_secs,
                )?,
                lock_ceiling_secs: env_or("LOCK_CEILING_SECS", defaults.lock_ceiling_secs)?,
                max_concurrent_dispatches: env_or(
                    "MAX_CONCURRENT_DISPATCHES",
                    defaults.max_concurrent_dispatches,
                )?,
                gateway_timeout_secs: env_or(
                    "GATEWAY_TIMEOUT_SECS",
                    defaults.gateway_timeout_secs,
                )?,
                driver_timeout_secs: env_or("DRIVER_TIMEOUT_SECS", defaults.driver_timeout_secs)?,
                driver_max_attempts: env_or("DRIVER_MAX_ATTEMPTS", defaults.driver_max_attempts)?,
                driver_retry_backoff_secs: env_or(
                    "DRIVER_RETRY_BACKOFF_SECS",
                    defaults.driver_retry_backoff_secs,
                )?,
                bulk_retry_delay_ms: env_or("BULK_RETRY_DELAY_MS", defaults.bulk_retry_delay_ms)?,
                audit_sweep_interval_secs: env_or(
                    "AUDIT_SWEEP_INTERVAL_SECS",
                    defaults.audit_sweep_interval_secs,
                )?,
            },
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, config::ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| config::ConfigError::Message(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_budget_covers_every_attempt() {
        let config = ReconcileConfig::default();
        // 3 attempts x 90s + 2 back-offs x 10s
        assert_eq!(config.driver_budget(), Duration::from_secs(290));
    }

    #[test]
    fn test_lock_heartbeat_stays_inside_the_ceiling() {
        let config = ReconcileConfig::default();
        assert_eq!(config.lock_heartbeat(), Duration::from_secs(60));
        assert!(config.lock_heartbeat() < config.lock_ceiling());

        let tight = ReconcileConfig {
            lock_ceiling_secs: 0,
            ..ReconcileConfig::default()
        };
        assert_eq!(tight.lock_heartbeat(), Duration::from_millis(50));
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        std::env::set_var("RECARGA_TEST_BAD_NUMBER", "ten");
        let parsed: Result<u64, _> = env_or("RECARGA_TEST_BAD_NUMBER", 10);
        assert!(parsed.is_err());

        let fallback: u64 = env_or("RECARGA_TEST_UNSET_NUMBER", 7).unwrap();
        assert_eq!(fallback, 7);
    }
}
