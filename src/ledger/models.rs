use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ReconcileError;

/// Reseller panel integration types.
/// The discriminator string stored in `payments.reseller_type` maps onto exactly one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelKind {
    Sigma,
    Koffice,
    GesOffice,
    P2Bras,
    RushPlay,
    PainelFoda,
    DashboardBz,
}

/// Per-kind table layout used to resolve a reseller reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelTables {
    pub resellers: &'static str,
    pub panels: &'static str,
    /// Column holding the account identifier understood by the panel
    pub account_column: &'static str,
}

impl fmt::Display for PanelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl PanelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PanelKind::Sigma => "sigma",
            PanelKind::Koffice => "koffice",
            PanelKind::GesOffice => "gesoffice",
            PanelKind::P2Bras => "p2bras",
            PanelKind::RushPlay => "rushplay",
            PanelKind::PainelFoda => "painelfoda",
            PanelKind::DashboardBz => "dashboardbz",
        }
    }

    /// Return all supported panel kinds
    pub fn all() -> Vec<PanelKind> {
        vec![
            PanelKind::Sigma,
            PanelKind::Koffice,
            PanelKind::GesOffice,
            PanelKind::P2Bras,
            PanelKind::RushPlay,
            PanelKind::PainelFoda,
            PanelKind::DashboardBz,
        ]
    }

    pub fn tables(&self) -> PanelTables {
        match self {
            PanelKind::Sigma => PanelTables {
                resellers: "sigma_resellers",
                panels: "sigma_panels",
                account_column: "sigma_user_id",
            },
            PanelKind::Koffice => PanelTables {
                resellers: "koffice_resellers",
                panels: "koffice_panels",
                account_column: "koffice_id",
            },
            PanelKind::GesOffice => PanelTables {
                resellers: "gesoffice_resellers",
                panels: "gesoffice_panels",
                account_column: "gesoffice_id",
            },
            PanelKind::P2Bras => PanelTables {
                resellers: "p2bras_resellers",
                panels: "p2bras_panels",
                account_column: "p2bras_id",
            },
            PanelKind::RushPlay => PanelTables {
                resellers: "rushplay_resellers",
                panels: "rushplay_panels",
                account_column: "rushplay_id",
            },
            PanelKind::PainelFoda => PanelTables {
                resellers: "painelfoda_resellers",
                panels: "painelfoda_panels",
                account_column: "painelfoda_id",
            },
            PanelKind::DashboardBz => PanelTables {
                resellers: "dashboardbz_resellers",
                panels: "dashboardbz_panels",
                account_column: "dashboardbz_id",
            },
        }
    }
}

impl FromStr for PanelKind {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PanelKind::all()
            .into_iter()
            .find(|kind| kind.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| ReconcileError::UnknownPanelKind(s.to_string()))
    }
}

/// Polymorphic reseller reference: the same id means different rows per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResellerRef {
    pub kind: PanelKind,
    pub id: i64,
}

impl ResellerRef {
    pub fn new(kind: PanelKind, id: i64) -> Self {
        Self { kind, id }
    }
}

/// Everything a driver needs to reach one reseller account, resolved from the per-kind tables
#[derive(Clone)]
pub struct PanelContext {
    pub kind: PanelKind,
    pub reseller_id: i64,
    pub tenant_id: i64,
    pub username: String,
    pub account_id: String,
    pub panel_url: String,
    pub admin_username: String,
    pub admin_password: String,
    pub has_captcha: bool,
    pub captcha_site_key: Option<String>,
}

impl PanelContext {
    /// Site key to solve before login, if the panel is gated
    pub fn captcha_site_key(&self) -> Option<&str> {
        if self.has_captcha {
            self.captcha_site_key.as_deref().filter(|k| !k.is_empty())
        } else {
            None
        }
    }
}

impl fmt::Debug for PanelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanelContext")
            .field("kind", &self.kind)
            .field("reseller_id", &self.reseller_id)
            .field("tenant_id", &self.tenant_id)
            .field("username", &self.username)
            .field("account_id", &self.account_id)
            .field("panel_url", &self.panel_url)
            .field("admin_username", &self.admin_username)
            .field("admin_password", &"***")
            .field("has_captcha", &self.has_captcha)
            .finish()
    }
}

/// Payment status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Error,
    Expired,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Error => "error",
            PaymentStatus::Expired => "expired",
        }
    }

    /// Valid transitions:
    /// - Pending → Paid, Error, Expired
    /// - Error → Paid, Error
    /// - Paid, Expired → nothing
    pub fn can_transition_to(&self, to: PaymentStatus) -> bool {
        matches!(
            (self, to),
            (PaymentStatus::Pending, PaymentStatus::Paid)
                | (PaymentStatus::Pending, PaymentStatus::Error)
                | (PaymentStatus::Pending, PaymentStatus::Expired)
                | (PaymentStatus::Error, PaymentStatus::Paid)
                | (PaymentStatus::Error, PaymentStatus::Error)
        )
    }

    /// Reject a conditional update whose source set contains an illegal edge
    pub fn check_transition(from: &[PaymentStatus], to: PaymentStatus) -> Result<(), ReconcileError> {
        match from.iter().find(|f| !f.can_transition_to(to)) {
            Some(bad) => Err(ReconcileError::IllegalTransition {
                from: bad.to_string(),
                to: to.to_string(),
            }),
            None if from.is_empty() => Err(ReconcileError::IllegalTransition {
                from: "nothing".to_string(),
                to: to.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Statuses a payment may be in for a transition into `to` to be legal
    pub fn sources_of(to: PaymentStatus) -> Vec<PaymentStatus> {
        [
            PaymentStatus::Pending,
            PaymentStatus::Paid,
            PaymentStatus::Error,
            PaymentStatus::Expired,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(to))
        .collect()
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "error" => Ok(PaymentStatus::Error),
            "expired" => Ok(PaymentStatus::Expired),
            other => Err(format!("unknown payment status: {}", other)),
        }
    }
}

/// Payment entity
#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: i64,
    pub tenant_id: i64,
    pub reseller_id: i64,
    /// Raw discriminator, parsed lazily so unknown values can be reported
    pub reseller_type: String,
    pub package_id: Option<i64>,
    pub credits: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub external_id: String,
    pub qr_code: String,
    pub status: PaymentStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub processing: bool,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    pub fn reseller_ref(&self) -> Result<ResellerRef, ReconcileError> {
        let kind = self.reseller_type.parse::<PanelKind>()?;
        Ok(ResellerRef::new(kind, self.reseller_id))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Payment plus its resolved panel context (None when the reference does not resolve)
#[derive(Debug, Clone)]
pub struct PaymentJoinRow {
    pub payment: Payment,
    pub panel: Option<PanelContext>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub tenant_id: i64,
    pub reseller_id: i64,
    pub reseller_type: String,
    pub package_id: Option<i64>,
    pub credits: i32,
    pub amount: Decimal,
    pub external_id: String,
    pub qr_code: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Audit row, one per reconciliation attempt
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub payment_id: i64,
    pub reseller_id: i64,
    pub reseller_type: String,
    pub credits: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub response: serde_json::Value,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub payment_id: i64,
    pub reseller_id: i64,
    pub reseller_type: String,
    pub credits: i32,
    pub amount: Decimal,
    pub response: serde_json::Value,
    pub success: bool,
}

impl NewTransaction {
    pub fn for_payment(payment: &Payment, response: serde_json::Value, success: bool) -> Self {
        Self {
            payment_id: payment.id,
            reseller_id: payment.reseller_id,
            reseller_type: payment.reseller_type.clone(),
            credits: payment.credits,
            amount: payment.amount,
            response,
            success,
        }
    }
}

/// Result of trying to take the persisted processing lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired,
    /// The previous holder exceeded the ceiling and was presumed dead
    Stolen,
    Busy,
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        !matches!(self, LockAcquisition::Busy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Inactive,
}

impl FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TenantStatus::Active),
            "inactive" => Ok(TenantStatus::Inactive),
            other => Err(format!("unknown tenant status: {}", other)),
        }
    }
}

///Tenant entity
#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub status: TenantStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Tenant {
    pub fn is_operational_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TenantStatus::Active && self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// Tenant config keys read by the reconciliation pipeline
pub mod config_keys {
    pub const GATEWAY_ACCESS_TOKEN: &str = "mercadopago_access_token";
    pub const CAPTCHA_API_KEY: &str = "captcha_api_key";
}

/// Row of a `<kind>_panels` table
#[derive(Debug, Clone)]
pub struct PanelRecord {
    pub id: i64,
    pub tenant_id: i64,
    pub url: String,
    pub admin_username: String,
    pub admin_password: String,
    pub has_captcha: bool,
    pub captcha_site_key: Option<String>,
}

/// Row of a `<kind>_resellers` table
#[derive(Debug, Clone)]
pub struct ResellerRecord {
    pub id: i64,
    pub tenant_id: i64,
    pub panel_id: i64,
    pub username: String,
    pub account_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditPackage {
    pub id: i64,
    pub tenant_id: i64,
    pub panel_type: String,
    pub name: String,
    pub credits: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Status says paid but no successful attempt was ever recorded
    PaidWithoutAudit,
    /// A successful attempt exists but the status write was lost
    CreditedNotPaid,
}

#[derive(Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub payment_id: i64,
    pub tenant_id: i64,
    pub status: PaymentStatus,
    pub successful_attempts: i64,
    pub kind: DiscrepancyKind,
}
