use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::captcha::CaptchaSolver;
use super::traits::{CreditOutcome, DriverFactory, DriverSecrets, PanelDriver};
use crate::error::DriverError;
use crate::ledger::models::{config_keys, PanelContext, PanelKind};

/// Drives a reseller panel through the panel-automation worker.
///
/// The worker owns the browser session (login, navigation, form submit); this
/// side supplies credentials, the target account and, for gated panels, a
/// solved CAPTCHA token.
pub struct AutomationDriver {
    client: Client,
    endpoint: String,
    ctx: PanelContext,
    captcha: Option<CaptchaAccess>,
}

struct CaptchaAccess {
    solver: Arc<dyn CaptchaSolver>,
    api_key: String,
    site_key: String,
}

#[derive(Debug, Serialize)]
struct CreditJob<'a> {
    panel_type: PanelKind,
    panel_url: &'a str,
    admin_username: &'a str,
    admin_password: &'a str,
    reseller_username: &'a str,
    account_id: &'a str,
    credits: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    captcha_token: Option<String>,
}

impl AutomationDriver {
    fn job<'a>(&'a self, account_id: &'a str, credits: i32, captcha_token: Option<String>) -> CreditJob<'a> {
        CreditJob {
            panel_type: self.ctx.kind,
            panel_url: &self.ctx.panel_url,
            admin_username: &self.ctx.admin_username,
            admin_password: &self.ctx.admin_password,
            reseller_username: &self.ctx.username,
            account_id,
            credits,
            captcha_token,
        }
    }
}

#[async_trait]
impl PanelDriver for AutomationDriver {
    fn kind(&self) -> PanelKind {
        self.ctx.kind
    }

    async fn add_credits(&self, account_id: &str, credits: i32) -> Result<CreditOutcome, DriverError> {
        let captcha_token = match &self.captcha {
            Some(access) => Some(
                access
                    .solver
                    .solve(&access.api_key, &access.site_key, &self.ctx.panel_url)
                    .await?,
            ),
            None => None,
        };

        debug!("Sending {} credits for {} to {} worker", credits, account_id, self.ctx.kind);

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&self.job(account_id, credits, captcha_token))
            .send()
            .await?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| DriverError::Transport(format!("worker replied {} with unreadable body: {}", status, e)))?;

        if status.is_server_error() {
            return Err(DriverError::Transport(format!("worker replied {}: {}", status, body)));
        }

        let outcome = CreditOutcome {
            success: body.get("success").and_then(|v| v.as_bool()).unwrap_or(false),
            message: body
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            response: body,
        };

        if outcome.success {
            info!("{} credited {} credits to {}", self.ctx.kind, credits, account_id);
        }
        Ok(outcome)
    }
}

/// Factory for one panel kind, sharing the HTTP client and CAPTCHA solver
pub struct AutomationDriverFactory {
    kind: PanelKind,
    client: Client,
    base_url: String,
    solver: Arc<dyn CaptchaSolver>,
}

impl AutomationDriverFactory {
    pub fn new(kind: PanelKind, client: Client, base_url: impl Into<String>, solver: Arc<dyn CaptchaSolver>) -> Self {
        Self {
            kind,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            solver,
        }
    }

    pub fn http_client(timeout: Duration) -> Result<Client, DriverError> {
        Ok(Client::builder().timeout(timeout).build()?)
    }

    fn endpoint(&self) -> String {
        format!("{}/panels/{}/credits", self.base_url, self.kind)
    }
}

impl DriverFactory for AutomationDriverFactory {
    fn kind(&self) -> PanelKind {
        self.kind
    }

    fn build(&self, ctx: &PanelContext, secrets: &DriverSecrets) -> Result<Arc<dyn PanelDriver>, DriverError> {
        let captcha = match ctx.captcha_site_key() {
            Some(site_key) => Some(CaptchaAccess {
                solver: self.solver.clone(),
                api_key: secrets.require(config_keys::CAPTCHA_API_KEY)?.to_string(),
                site_key: site_key.to_string(),
            }),
            None => None,
        };

        Ok(Arc::new(AutomationDriver {
            client: self.client.clone(),
            endpoint: self.endpoint(),
            ctx: ctx.clone(),
            captcha,
        }))
    }
}
