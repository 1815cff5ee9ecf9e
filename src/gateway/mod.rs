pub mod mercadopago;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

pub use mercadopago::MercadoPagoGateway;

/// Charge states reported by the gateway, normalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Approved,
    Pending,
    InProcess,
    Authorized,
    Cancelled,
    Expired,
    Rejected,
    Refunded,
    ChargedBack,
    Unknown,
}

/// What the reconciliation pipeline should do with a charge in a given state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Money arrived: credit the reseller
    Approved,
    /// The charge can never settle: expire the payment
    Void,
    /// Still waiting on the payer
    Open,
}

impl GatewayStatus {
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approved" => GatewayStatus::Approved,
            "pending" => GatewayStatus::Pending,
            "in_process" => GatewayStatus::InProcess,
            "authorized" => GatewayStatus::Authorized,
            "cancelled" | "canceled" => GatewayStatus::Cancelled,
            "expired" => GatewayStatus::Expired,
            "rejected" => GatewayStatus::Rejected,
            "refunded" => GatewayStatus::Refunded,
            "charged_back" => GatewayStatus::ChargedBack,
            _ => GatewayStatus::Unknown,
        }
    }

    pub fn settlement(&self) -> Settlement {
        match self {
            GatewayStatus::Approved => Settlement::Approved,
            GatewayStatus::Cancelled
            | GatewayStatus::Expired
            | GatewayStatus::Rejected
            | GatewayStatus::Refunded
            | GatewayStatus::ChargedBack => Settlement::Void,
            GatewayStatus::Pending
            | GatewayStatus::InProcess
            | GatewayStatus::Authorized
            | GatewayStatus::Unknown => Settlement::Open,
        }
    }
}

/// Status of one charge as seen by the gateway
#[derive(Debug, Clone, Serialize)]
pub struct ChargeStatus {
    pub status: GatewayStatus,
    /// Raw status string, shown to end users as-is
    pub raw: String,
}

impl ChargeStatus {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            status: GatewayStatus::from_raw(&raw),
            raw,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PixChargeRequest {
    pub amount: Decimal,
    pub description: String,
    pub payer_email: String,
    pub external_reference: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PixCharge {
    pub external_id: String,
    pub qr_code: String,
    pub qr_code_base64: Option<String>,
    pub status: ChargeStatus,
}

/// Payment gateway capability. Each call carries the tenant's own access token.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_pix_charge(
        &self,
        access_token: &str,
        request: &PixChargeRequest,
    ) -> Result<PixCharge, GatewayError>;

    async fn get_status(
        &self,
        access_token: &str,
        external_id: &str,
    ) -> Result<ChargeStatus, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_settlement_mapping() {
        assert_eq!(ChargeStatus::from_raw("approved").status.settlement(), Settlement::Approved);
        assert_eq!(ChargeStatus::from_raw("cancelled").status.settlement(), Settlement::Void);
        assert_eq!(ChargeStatus::from_raw("expired").status.settlement(), Settlement::Void);
        assert_eq!(ChargeStatus::from_raw("in_process").status.settlement(), Settlement::Open);
        assert_eq!(ChargeStatus::from_raw("pending").status.settlement(), Settlement::Open);
    }

    #[test]
    fn test_unknown_status_keeps_raw_value() {
        let status = ChargeStatus::from_raw("in_mediation");
        assert_eq!(status.status, GatewayStatus::Unknown);
        assert_eq!(status.status.settlement(), Settlement::Open);
        assert_eq!(status.raw, "in_mediation");
    }
}
