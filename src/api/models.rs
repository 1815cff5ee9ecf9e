use crate::gateway::PixCharge;
use crate::ledger::models::*;
use crate::reconciliation::{ReconcileOutcome, ReconcileReport};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

// ========== REQUEST MODELS ==========

/// Request to open a PIX charge for a credit package
#[derive(Debug, Deserialize, Validate)]
pub struct CreatePaymentRequest {
    #[validate(range(min = 1, message = "must be positive"))]
    pub tenant_id: i64,

    /// Panel discriminator, e.g. `koffice`
    #[validate(length(min = 1, max = 32, message = "must be 1-32 characters"))]
    pub reseller_type: String,

    #[validate(range(min = 1, message = "must be positive"))]
    pub reseller_id: i64,

    #[validate(range(min = 1, message = "must be positive"))]
    pub package_id: i64,

    #[validate(email(message = "must be a valid email"))]
    pub payer_email: String,
}

/// Optional reseller filter for bulk retries
#[derive(Debug, Default, Deserialize)]
pub struct RetryErrorsQuery {
    pub reseller_type: Option<String>,
    pub reseller_id: Option<i64>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub payment_id: i64,
    pub tenant_id: i64,
    pub reseller_type: String,
    pub reseller_id: i64,
    pub credits: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub status: String,
    pub qr_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code_base64: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        Self {
            payment_id: payment.id,
            tenant_id: payment.tenant_id,
            reseller_type: payment.reseller_type,
            reseller_id: payment.reseller_id,
            credits: payment.credits,
            amount: payment.amount,
            status: payment.status.as_str().to_string(),
            qr_code: payment.qr_code,
            qr_code_base64: None,
            expires_at: payment.expires_at,
            paid_at: payment.paid_at,
            created_at: payment.created_at,
        }
    }
}

impl PaymentResponse {
    pub fn with_charge(payment: Payment, charge: PixCharge) -> Self {
        Self {
            qr_code_base64: charge.qr_code_base64,
            ..Self::from(payment)
        }
    }
}

/// Manual check result: current status plus a human-readable message
#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub payment_id: i64,
    pub status: Option<String>,
    pub outcome: ReconcileOutcome,
    pub message: String,
}

impl From<ReconcileReport> for CheckResponse {
    fn from(report: ReconcileReport) -> Self {
        Self {
            payment_id: report.payment_id,
            status: report.status.map(|s| s.as_str().to_string()),
            outcome: report.outcome,
            message: report.message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    pub payment_id: i64,
    pub transactions: Vec<TransactionRecord>,
}

#[derive(Debug, Serialize)]
pub struct DiscrepanciesResponse {
    pub count: usize,
    pub discrepancies: Vec<Discrepancy>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub in_flight: usize,
    pub panel_kinds: Vec<String>,
}
