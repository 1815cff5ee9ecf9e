use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info};

use crate::error::DriverError;

/// Solves a reCAPTCHA challenge, returning the response token
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, api_key: &str, site_key: &str, page_url: &str) -> Result<String, DriverError>;
}

/// 2Captcha-compatible `in.php` / `res.php` client
pub struct TwoCaptchaSolver {
    client: Client,
    base_url: String,
    poll_attempts: u32,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    status: i32,
    request: String,
}

const NOT_READY: &str = "CAPCHA_NOT_READY";

impl TwoCaptchaSolver {
    pub fn new(base_url: impl Into<String>, poll_attempts: u32, poll_interval: Duration) -> Result<Self, DriverError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DriverError::Captcha(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_attempts,
            poll_interval,
        })
    }

    async fn call(&self, path: &str, query: &[(&str, &str)]) -> Result<ApiReply, DriverError> {
        let reply = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .query(query)
            .send()
            .await
            .map_err(|e| DriverError::Captcha(e.to_string()))?
            .json::<ApiReply>()
            .await
            .map_err(|e| DriverError::Captcha(format!("unreadable reply: {}", e)))?;
        Ok(reply)
    }
}

#[async_trait]
impl CaptchaSolver for TwoCaptchaSolver {
    async fn solve(&self, api_key: &str, site_key: &str, page_url: &str) -> Result<String, DriverError> {
        let submitted = self
            .call(
                "in.php",
                &[
                    ("key", api_key),
                    ("method", "userrecaptcha"),
                    ("googlekey", site_key),
                    ("pageurl", page_url),
                    ("json", "1"),
                ],
            )
            .await?;

        if submitted.status != 1 {
            return Err(DriverError::Captcha(submitted.request));
        }
        let task_id = submitted.request;
        debug!("CAPTCHA task {} submitted for {}", task_id, page_url);

        for _ in 0..self.poll_attempts {
            time::sleep(self.poll_interval).await;

            let reply = self
                .call(
                    "res.php",
                    &[("key", api_key), ("action", "get"), ("id", &task_id), ("json", "1")],
                )
                .await?;

            match poll_result(reply)? {
                Some(token) => {
                    info!("CAPTCHA task {} solved", task_id);
                    return Ok(token);
                }
                None => continue,
            }
        }

        Err(DriverError::Captcha(format!(
            "task {} not solved after {} polls",
            task_id, self.poll_attempts
        )))
    }
}

/// `Ok(None)` while the task is still queued
fn poll_result(reply: ApiReply) -> Result<Option<String>, DriverError> {
    if reply.status == 1 {
        Ok(Some(reply.request))
    } else if reply.request == NOT_READY {
        Ok(None)
    } else {
        Err(DriverError::Captcha(reply.request))
    }
}
