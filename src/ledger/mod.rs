pub mod memory;
pub mod models;
pub mod repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::AppResult;
use models::*;

pub use memory::MemoryPaymentStore;
pub use repository::PgPaymentStore;

/// Persistent store contract used by the reconciliation pipeline.
///
/// Every status change and lock operation is a single conditional write,
/// never a read followed by a write.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Pending, unexpired payments of operational tenants, each joined to its panel context
    async fn pending_payments(&self) -> AppResult<Vec<PaymentJoinRow>>;

    async fn get_payment(&self, payment_id: i64) -> AppResult<Option<PaymentJoinRow>>;

    /// Move `payment_id` to `to` if its current status is one of `from`.
    /// Returns false when no row matched.
    async fn set_payment_status(
        &self,
        payment_id: i64,
        from: &[PaymentStatus],
        to: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> AppResult<bool>;

    async fn insert_transaction(&self, transaction: NewTransaction) -> AppResult<i64>;

    /// Status transition and audit row in one unit. The audit row is written
    /// even when the conditional status update matches nothing.
    async fn record_outcome(
        &self,
        payment_id: i64,
        from: &[PaymentStatus],
        to: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
        transaction: NewTransaction,
    ) -> AppResult<bool>;

    /// Take the processing lock for `token`, stealing it when its last
    /// heartbeat is older than `ceiling`
    async fn acquire_lock(
        &self,
        payment_id: i64,
        ceiling: Duration,
        token: &str,
    ) -> AppResult<LockAcquisition>;

    /// Refresh the heartbeat of a lock still held by `token`.
    /// Returns false when the lock was taken over or released.
    async fn renew_lock(&self, payment_id: i64, token: &str) -> AppResult<bool>;

    /// Release the lock only if `token` still holds it
    async fn release_lock(&self, payment_id: i64, token: &str) -> AppResult<bool>;

    async fn tenant_config(&self, tenant_id: i64, key: &str) -> AppResult<Option<String>>;

    async fn tenant(&self, tenant_id: i64) -> AppResult<Option<Tenant>>;

    /// Resolve a reseller reference within one tenant
    async fn resolve_panel(
        &self,
        reference: ResellerRef,
        tenant_id: i64,
    ) -> AppResult<Option<PanelContext>>;

    /// Ids of `error` payments for a tenant, optionally narrowed to one reseller
    async fn error_payments(
        &self,
        tenant_id: i64,
        reseller: Option<ResellerRef>,
    ) -> AppResult<Vec<i64>>;

    async fn transactions_for_payment(&self, payment_id: i64) -> AppResult<Vec<TransactionRecord>>;

    async fn package(&self, tenant_id: i64, package_id: i64) -> AppResult<Option<CreditPackage>>;

    async fn create_payment(&self, payment: NewPayment) -> AppResult<Payment>;

    /// Payments whose status disagrees with their successful audit rows
    async fn audit_discrepancies(&self) -> AppResult<Vec<Discrepancy>>;
}
