use async_trait::async_trait;
use reqwest::{Client, Url};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChargeStatus, PaymentGateway, PixCharge, PixChargeRequest};
use crate::error::GatewayError;

/// Mercado Pago `/v1/payments` client for PIX charges
pub struct MercadoPagoGateway {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct CreatePaymentBody<'a> {
    transaction_amount: f64,
    description: &'a str,
    payment_method_id: &'static str,
    payer: Payer<'a>,
    external_reference: &'a str,
    date_of_expiration: String,
}

#[derive(Debug, Serialize)]
struct Payer<'a> {
    email: &'a str,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: serde_json::Value,
    status: String,
    #[serde(default)]
    point_of_interaction: Option<PointOfInteraction>,
}

#[derive(Debug, Deserialize)]
struct PointOfInteraction {
    #[serde(default)]
    transaction_data: Option<TransactionData>,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    qr_code: Option<String>,
    qr_code_base64: Option<String>,
}

impl PaymentResponse {
    /// Mercado Pago returns numeric ids; keep them as opaque strings
    fn external_id(&self) -> String {
        match &self.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl MercadoPagoGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// `/v1/payments/{id}` with the id encoded as a single path segment
    fn payment_url(&self, external_id: &str) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&format!("{}/v1/payments", self.base_url))
            .map_err(|e| GatewayError::Http(format!("invalid gateway url {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| GatewayError::Http(format!("gateway url {} cannot take a path", self.base_url)))?
            .push(external_id);
        Ok(url)
    }

    async fn parse<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T, GatewayError> {
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str::<T>(&body)
            .map_err(|e| GatewayError::InvalidResponse(format!("{}; body={}", e, body)))
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoGateway {
    fn name(&self) -> &'static str {
        "mercadopago"
    }

    async fn create_pix_charge(
        &self,
        access_token: &str,
        request: &PixChargeRequest,
    ) -> Result<PixCharge, GatewayError> {
        let amount = request
            .amount
            .round_dp(2)
            .to_f64()
            .ok_or_else(|| GatewayError::InvalidResponse(format!("amount {} is not representable", request.amount)))?;

        let body = CreatePaymentBody {
            transaction_amount: amount,
            description: &request.description,
            payment_method_id: "pix",
            payer: Payer {
                email: &request.payer_email,
            },
            external_reference: &request.external_reference,
            date_of_expiration: request
                .expires_at
                .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
                .to_string(),
        };

        let resp = self
            .client
            .post(format!("{}/v1/payments", self.base_url))
            .bearer_auth(access_token)
            .header("X-Idempotency-Key", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await?;

        let payment: PaymentResponse = Self::parse(resp).await?;
        let transaction_data = payment
            .point_of_interaction
            .as_ref()
            .and_then(|poi| poi.transaction_data.as_ref());

        let qr_code = transaction_data
            .and_then(|data| data.qr_code.clone())
            .ok_or_else(|| GatewayError::InvalidResponse("PIX charge without qr_code".to_string()))?;

        let charge = PixCharge {
            external_id: payment.external_id(),
            qr_code,
            qr_code_base64: transaction_data.and_then(|data| data.qr_code_base64.clone()),
            status: ChargeStatus::from_raw(payment.status.clone()),
        };

        info!(
            "PIX charge {} created for {} ({})",
            charge.external_id, request.external_reference, charge.status.raw
        );
        Ok(charge)
    }

    async fn get_status(
        &self,
        access_token: &str,
        external_id: &str,
    ) -> Result<ChargeStatus, GatewayError> {
        let resp = self
            .client
            .get(self.payment_url(external_id)?)
            .bearer_auth(access_token)
            .send()
            .await?;

        let payment: PaymentResponse = Self::parse(resp).await?;
        debug!("Gateway status for {}: {}", external_id, payment.status);

        Ok(ChargeStatus::from_raw(payment.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_response_parsing() {
        let body = serde_json::json!({
            "id": 1319873921,
            "status": "pending",
            "point_of_interaction": {
                "transaction_data": {
                    "qr_code": "00020126580014br.gov.bcb.pix",
                    "qr_code_base64": "iVBORw0KGgo="
                }
            }
        });

        let parsed: PaymentResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.external_id(), "1319873921");
        assert_eq!(parsed.status, "pending");
        let data = parsed.point_of_interaction.unwrap().transaction_data.unwrap();
        assert!(data.qr_code.unwrap().starts_with("000201"));
    }

    #[test]
    fn test_status_only_response() {
        let parsed: PaymentResponse =
            serde_json::from_value(serde_json::json!({ "id": "abc", "status": "approved" })).unwrap();
        assert_eq!(parsed.external_id(), "abc");
        assert!(parsed.point_of_interaction.is_none());
    }

    #[test]
    fn test_external_id_stays_one_path_segment() {
        let gateway = MercadoPagoGateway::new("https://api.mercadopago.com", Duration::from_secs(5)).unwrap();

        let url = gateway.payment_url("1319873921").unwrap();
        assert_eq!(url.as_str(), "https://api.mercadopago.com/v1/payments/1319873921");

        let url = gateway.payment_url("../v1/customers?x=1#frag").unwrap();
        assert_eq!(url.path_segments().unwrap().count(), 3);
        assert!(url.as_str().starts_with("https://api.mercadopago.com/v1/payments/"));
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
        assert!(!url.path().contains("customers?"));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let gateway = MercadoPagoGateway::new("https://api.mercadopago.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(gateway.base_url, "https://api.mercadopago.com");
    }
}
