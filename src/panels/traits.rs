use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::ReconcileConfig;
use crate::error::DriverError;
use crate::ledger::models::{config_keys, PanelContext, PanelKind};

/// Result of one credit attempt, as reported by the panel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditOutcome {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    /// Raw panel payload, persisted in the audit row
    #[serde(default)]
    pub response: serde_json::Value,
}

impl CreditOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            response: serde_json::Value::Null,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            response: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Hard ceiling for a single `add_credits` call
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ReconcileConfig> for RetryPolicy {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            max_attempts: config.driver_max_attempts,
            backoff: Duration::from_secs(config.driver_retry_backoff_secs),
            attempt_timeout: Duration::from_secs(config.driver_timeout_secs),
        }
    }
}

/// A panel integration able to add credits to one reseller account.
///
/// Drivers are built per dispatch with the panel's current credentials and
/// are dropped afterwards, so implementations may hold session state freely.
#[async_trait]
pub trait PanelDriver: Send + Sync {
    fn kind(&self) -> PanelKind;

    /// Single attempt. A rejection by the panel is `Ok` with `success = false`.
    async fn add_credits(&self, account_id: &str, credits: i32) -> Result<CreditOutcome, DriverError>;

    /// Retries failed attempts with a fixed back-off; returns the first success
    /// or the last failure.
    async fn add_credits_with_retry(
        &self,
        account_id: &str,
        credits: i32,
        policy: &RetryPolicy,
    ) -> Result<CreditOutcome, DriverError> {
        let attempts = policy.max_attempts.max(1);
        let mut last_error = DriverError::Transport("no attempt made".to_string());

        for attempt in 1..=attempts {
            match tokio::time::timeout(policy.attempt_timeout, self.add_credits(account_id, credits)).await {
                Ok(Ok(outcome)) if outcome.success => return Ok(outcome),
                Ok(Ok(outcome)) => {
                    warn!(
                        "{} rejected {} credits for {} (attempt {}/{}): {}",
                        self.kind(), credits, account_id, attempt, attempts, outcome.message
                    );
                    last_error = DriverError::Rejected(outcome.message);
                }
                Ok(Err(e)) => {
                    warn!(
                        "{} credit attempt {}/{} for {} failed: {}",
                        self.kind(), attempt, attempts, account_id, e
                    );
                    last_error = e;
                }
                Err(_) => {
                    warn!(
                        "{} credit attempt {}/{} for {} timed out",
                        self.kind(), attempt, attempts, account_id
                    );
                    last_error = DriverError::Timeout(policy.attempt_timeout.as_secs());
                }
            }

            if attempt < attempts {
                tokio::time::sleep(policy.backoff).await;
            }
        }

        Err(last_error)
    }
}

/// Tenant-scoped secrets handed to a driver factory
#[derive(Debug, Clone, Default)]
pub struct DriverSecrets {
    values: HashMap<String, String>,
}

impl DriverSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, DriverError> {
        self.get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| DriverError::MissingSecret(key.to_string()))
    }
}

/// Builds a fresh driver for one dispatch
pub trait DriverFactory: Send + Sync {
    fn kind(&self) -> PanelKind;

    /// Tenant config keys this panel needs before a driver can be built
    fn required_secrets(&self, ctx: &PanelContext) -> Vec<&'static str> {
        if ctx.captcha_site_key().is_some() {
            vec![config_keys::CAPTCHA_API_KEY]
        } else {
            Vec::new()
        }
    }

    fn build(&self, ctx: &PanelContext, secrets: &DriverSecrets) -> Result<Arc<dyn PanelDriver>, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `fail_times` calls, then succeeds
    struct FlakyDriver {
        calls: AtomicU32,
        fail_times: u32,
    }

    #[async_trait]
    impl PanelDriver for FlakyDriver {
        fn kind(&self) -> PanelKind {
            PanelKind::Koffice
        }

        async fn add_credits(&self, _account_id: &str, credits: i32) -> Result<CreditOutcome, DriverError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_times {
                Ok(CreditOutcome::failed("CAPTCHA rejected"))
            } else {
                Ok(CreditOutcome::ok(format!("{} credits added", credits)))
            }
        }
    }

    struct HangingDriver;

    #[async_trait]
    impl PanelDriver for HangingDriver {
        fn kind(&self) -> PanelKind {
            PanelKind::Sigma
        }

        async fn add_credits(&self, _account_id: &str, _credits: i32) -> Result<CreditOutcome, DriverError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(CreditOutcome::ok("too late"))
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_after_rejection() {
        let driver = FlakyDriver { calls: AtomicU32::new(0), fail_times: 2 };
        let outcome = driver.add_credits_with_retry("42", 100, &fast_policy(3)).await.unwrap();

        assert!(outcome.success);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_surfaces_last_rejection() {
        let driver = FlakyDriver { calls: AtomicU32::new(0), fail_times: 10 };
        let err = driver.add_credits_with_retry("42", 100, &fast_policy(3)).await.unwrap_err();

        assert!(matches!(err, DriverError::Rejected(ref msg) if msg == "CAPTCHA rejected"));
        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hanging_attempt_times_out() {
        let err = HangingDriver
            .add_credits_with_retry("1", 10, &fast_policy(2))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Timeout(_)));
    }

    #[test]
    fn test_require_rejects_blank_secret() {
        let mut secrets = DriverSecrets::new();
        secrets.insert(config_keys::CAPTCHA_API_KEY, "");
        assert!(matches!(
            secrets.require(config_keys::CAPTCHA_API_KEY),
            Err(DriverError::MissingSecret(_))
        ));

        secrets.insert(config_keys::CAPTCHA_API_KEY, "k");
        assert_eq!(secrets.require(config_keys::CAPTCHA_API_KEY).unwrap(), "k");
    }
}
