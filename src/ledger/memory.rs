use super::models::*;
use super::PaymentStore;
use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// In-process store with the same conditional-write semantics as Postgres.
/// Every operation runs under one write guard, which plays the role of the row lock.
pub struct MemoryPaymentStore {
    state: tokio::sync::RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<i64, Tenant>,
    config: HashMap<(i64, String), String>,
    panels: HashMap<(PanelKind, i64), PanelRecord>,
    resellers: HashMap<(PanelKind, i64), ResellerRecord>,
    packages: HashMap<i64, CreditPackage>,
    payments: BTreeMap<i64, Payment>,
    transactions: Vec<TransactionRecord>,
    lock_holders: HashMap<i64, String>,
    next_payment_id: i64,
}

impl MemoryState {
    fn resolve(&self, reference: ResellerRef, tenant_id: i64) -> Option<PanelContext> {
        let reseller = self.resellers.get(&(reference.kind, reference.id))?;
        if reseller.tenant_id != tenant_id {
            return None;
        }
        let panel = self.panels.get(&(reference.kind, reseller.panel_id))?;
        if panel.tenant_id != reseller.tenant_id {
            return None;
        }

        Some(PanelContext {
            kind: reference.kind,
            reseller_id: reseller.id,
            tenant_id: reseller.tenant_id,
            username: reseller.username.clone(),
            account_id: reseller.account_id.clone(),
            panel_url: panel.url.clone(),
            admin_username: panel.admin_username.clone(),
            admin_password: panel.admin_password.clone(),
            has_captcha: panel.has_captcha,
            captcha_site_key: panel.captcha_site_key.clone(),
        })
    }

    fn join(&self, payment: &Payment) -> PaymentJoinRow {
        let panel = payment
            .reseller_ref()
            .ok()
            .and_then(|reference| self.resolve(reference, payment.tenant_id));

        PaymentJoinRow {
            payment: payment.clone(),
            panel,
        }
    }

    fn transition(
        &mut self,
        payment_id: i64,
        from: &[PaymentStatus],
        to: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> bool {
        match self.payments.get_mut(&payment_id) {
            Some(payment) if from.contains(&payment.status) => {
                payment.status = to;
                if paid_at.is_some() {
                    payment.paid_at = paid_at;
                }
                true
            }
            _ => false,
        }
    }

    fn append(&mut self, transaction: NewTransaction) -> i64 {
        let id = self.transactions.len() as i64 + 1;
        self.transactions.push(TransactionRecord {
            id,
            payment_id: transaction.payment_id,
            reseller_id: transaction.reseller_id,
            reseller_type: transaction.reseller_type,
            credits: transaction.credits,
            amount: transaction.amount,
            response: transaction.response,
            success: transaction.success,
            created_at: Utc::now(),
        });
        id
    }
}

impl MemoryPaymentStore {
    pub fn new() -> Self {
        Self {
            state: tokio::sync::RwLock::new(MemoryState::default()),
        }
    }

    pub async fn insert_tenant(&self, tenant: Tenant) {
        self.state.write().await.tenants.insert(tenant.id, tenant);
    }

    pub async fn set_tenant_config(&self, tenant_id: i64, key: &str, value: &str) {
        self.state
            .write()
            .await
            .config
            .insert((tenant_id, key.to_string()), value.to_string());
    }

    pub async fn insert_panel(&self, kind: PanelKind, panel: PanelRecord) {
        self.state.write().await.panels.insert((kind, panel.id), panel);
    }

    pub async fn insert_reseller(&self, kind: PanelKind, reseller: ResellerRecord) {
        self.state
            .write()
            .await
            .resellers
            .insert((kind, reseller.id), reseller);
    }

    pub async fn insert_package(&self, package: CreditPackage) {
        self.state.write().await.packages.insert(package.id, package);
    }

    /// Pretend the current lock holder started `age` ago
    pub async fn backdate_lock(&self, payment_id: i64, age: chrono::Duration) {
        if let Some(payment) = self.state.write().await.payments.get_mut(&payment_id) {
            payment.processing_started_at = Some(Utc::now() - age);
        }
    }

    /// Force a status, bypassing the state machine (fixtures only)
    pub async fn force_status(&self, payment_id: i64, status: PaymentStatus) {
        if let Some(payment) = self.state.write().await.payments.get_mut(&payment_id) {
            payment.status = status;
        }
    }

    pub async fn all_transactions(&self) -> Vec<TransactionRecord> {
        self.state.read().await.transactions.clone()
    }
}

impl Default for MemoryPaymentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentStore for MemoryPaymentStore {
    async fn pending_payments(&self) -> AppResult<Vec<PaymentJoinRow>> {
        let state = self.state.read().await;
        let now = Utc::now();

        let mut rows: Vec<PaymentJoinRow> = state
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Pending && !p.is_expired_at(now))
            .filter(|p| {
                state
                    .tenants
                    .get(&p.tenant_id)
                    .map(|t| t.is_operational_at(now))
                    .unwrap_or(false)
            })
            .map(|p| state.join(p))
            .collect();
        rows.sort_by_key(|row| row.payment.created_at);

        Ok(rows)
    }

    async fn get_payment(&self, payment_id: i64) -> AppResult<Option<PaymentJoinRow>> {
        let state = self.state.read().await;
        Ok(state.payments.get(&payment_id).map(|p| state.join(p)))
    }

    async fn set_payment_status(
        &self,
        payment_id: i64,
        from: &[PaymentStatus],
        to: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> AppResult<bool> {
        PaymentStatus::check_transition(from, to)?;
        Ok(self.state.write().await.transition(payment_id, from, to, paid_at))
    }

    async fn insert_transaction(&self, transaction: NewTransaction) -> AppResult<i64> {
        Ok(self.state.write().await.append(transaction))
    }

    async fn record_outcome(
        &self,
        payment_id: i64,
        from: &[PaymentStatus],
        to: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
        transaction: NewTransaction,
    ) -> AppResult<bool> {
        PaymentStatus::check_transition(from, to)?;

        let mut state = self.state.write().await;
        let updated = state.transition(payment_id, from, to, paid_at);
        state.append(transaction);
        Ok(updated)
    }

    async fn acquire_lock(
        &self,
        payment_id: i64,
        ceiling: Duration,
        token: &str,
    ) -> AppResult<LockAcquisition> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(payment) = state.payments.get_mut(&payment_id) else {
            return Ok(LockAcquisition::Busy);
        };

        let now = Utc::now();
        let ceiling = chrono::Duration::from_std(ceiling).unwrap_or_else(|_| chrono::Duration::days(3650));
        let acquisition = match (payment.processing, payment.processing_started_at) {
            (false, _) => LockAcquisition::Acquired,
            (true, None) => LockAcquisition::Stolen,
            (true, Some(started)) if now - started > ceiling => LockAcquisition::Stolen,
            (true, Some(_)) => LockAcquisition::Busy,
        };

        if acquisition.is_acquired() {
            payment.processing = true;
            payment.processing_started_at = Some(now);
            state.lock_holders.insert(payment_id, token.to_string());
        }
        Ok(acquisition)
    }

    async fn renew_lock(&self, payment_id: i64, token: &str) -> AppResult<bool> {
        let mut state = self.state.write().await;
        if state.lock_holders.get(&payment_id).map(String::as_str) != Some(token) {
            return Ok(false);
        }

        match state.payments.get_mut(&payment_id) {
            Some(payment) if payment.processing => {
                payment.processing_started_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, payment_id: i64, token: &str) -> AppResult<bool> {
        let mut state = self.state.write().await;
        if state.lock_holders.get(&payment_id).map(String::as_str) != Some(token) {
            return Ok(false);
        }

        state.lock_holders.remove(&payment_id);
        if let Some(payment) = state.payments.get_mut(&payment_id) {
            payment.processing = false;
            payment.processing_started_at = None;
        }
        Ok(true)
    }

    async fn tenant_config(&self, tenant_id: i64, key: &str) -> AppResult<Option<String>> {
        Ok(self
            .state
            .read()
            .await
            .config
            .get(&(tenant_id, key.to_string()))
            .cloned())
    }

    async fn tenant(&self, tenant_id: i64) -> AppResult<Option<Tenant>> {
        Ok(self.state.read().await.tenants.get(&tenant_id).cloned())
    }

    async fn resolve_panel(
        &self,
        reference: ResellerRef,
        tenant_id: i64,
    ) -> AppResult<Option<PanelContext>> {
        Ok(self.state.read().await.resolve(reference, tenant_id))
    }

    async fn error_payments(
        &self,
        tenant_id: i64,
        reseller: Option<ResellerRef>,
    ) -> AppResult<Vec<i64>> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.status == PaymentStatus::Error)
            .filter(|p| match reseller {
                Some(reference) => p.reseller_ref().ok() == Some(reference),
                None => true,
            })
            .map(|p| p.id)
            .collect())
    }

    async fn transactions_for_payment(&self, payment_id: i64) -> AppResult<Vec<TransactionRecord>> {
        Ok(self
            .state
            .read()
            .await
            .transactions
            .iter()
            .filter(|t| t.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn package(&self, tenant_id: i64, package_id: i64) -> AppResult<Option<CreditPackage>> {
        Ok(self
            .state
            .read()
            .await
            .packages
            .get(&package_id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    async fn create_payment(&self, payment: NewPayment) -> AppResult<Payment> {
        let mut state = self.state.write().await;
        state.next_payment_id += 1;
        let id = state.next_payment_id;

        let created = Payment {
            id,
            tenant_id: payment.tenant_id,
            reseller_id: payment.reseller_id,
            reseller_type: payment.reseller_type,
            package_id: payment.package_id,
            credits: payment.credits,
            amount: payment.amount,
            external_id: payment.external_id,
            qr_code: payment.qr_code,
            status: PaymentStatus::Pending,
            expires_at: payment.expires_at,
            paid_at: None,
            processing: false,
            processing_started_at: None,
            created_at: Utc::now(),
        };
        state.payments.insert(id, created.clone());
        Ok(created)
    }

    async fn audit_discrepancies(&self) -> AppResult<Vec<Discrepancy>> {
        let state = self.state.read().await;

        Ok(state
            .payments
            .values()
            .filter_map(|p| {
                let successful_attempts = state
                    .transactions
                    .iter()
                    .filter(|t| t.payment_id == p.id && t.success)
                    .count() as i64;

                let kind = match (p.status, successful_attempts) {
                    (PaymentStatus::Paid, 0) => DiscrepancyKind::PaidWithoutAudit,
                    (PaymentStatus::Paid, _) => return None,
                    (_, 0) => return None,
                    (_, _) => DiscrepancyKind::CreditedNotPaid,
                };

                Some(Discrepancy {
                    payment_id: p.id,
                    tenant_id: p.tenant_id,
                    status: p.status,
                    successful_attempts,
                    kind,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn store_with_payment() -> (MemoryPaymentStore, i64) {
        let store = MemoryPaymentStore::new();
        store
            .insert_tenant(Tenant {
                id: 1,
                name: "loja".to_string(),
                status: TenantStatus::Active,
                expires_at: None,
            })
            .await;
        let payment = store
            .create_payment(NewPayment {
                tenant_id: 1,
                reseller_id: 7,
                reseller_type: "sigma".to_string(),
                package_id: None,
                credits: 10,
                amount: dec!(25.00),
                external_id: "mp-1".to_string(),
                qr_code: "000201".to_string(),
                expires_at: None,
            })
            .await
            .unwrap();
        (store, payment.id)
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let (store, id) = store_with_payment().await;
        let ceiling = Duration::from_secs(180);

        assert_eq!(store.acquire_lock(id, ceiling, "a").await.unwrap(), LockAcquisition::Acquired);
        assert_eq!(store.acquire_lock(id, ceiling, "b").await.unwrap(), LockAcquisition::Busy);

        assert!(store.release_lock(id, "a").await.unwrap());
        assert_eq!(store.acquire_lock(id, ceiling, "b").await.unwrap(), LockAcquisition::Acquired);
    }

    #[tokio::test]
    async fn test_stale_lock_is_stolen() {
        let (store, id) = store_with_payment().await;
        let ceiling = Duration::from_secs(180);

        store.acquire_lock(id, ceiling, "a").await.unwrap();
        store.backdate_lock(id, chrono::Duration::seconds(179)).await;
        assert_eq!(store.acquire_lock(id, ceiling, "b").await.unwrap(), LockAcquisition::Busy);

        store.backdate_lock(id, chrono::Duration::seconds(181)).await;
        assert_eq!(store.acquire_lock(id, ceiling, "b").await.unwrap(), LockAcquisition::Stolen);
        assert_eq!(store.acquire_lock(id, ceiling, "c").await.unwrap(), LockAcquisition::Busy);
    }

    #[tokio::test]
    async fn test_previous_holder_cannot_release_a_stolen_lock() {
        let (store, id) = store_with_payment().await;
        let ceiling = Duration::from_secs(180);

        store.acquire_lock(id, ceiling, "a").await.unwrap();
        store.backdate_lock(id, chrono::Duration::seconds(181)).await;
        assert_eq!(store.acquire_lock(id, ceiling, "b").await.unwrap(), LockAcquisition::Stolen);

        assert!(!store.release_lock(id, "a").await.unwrap());
        assert!(!store.renew_lock(id, "a").await.unwrap());
        assert_eq!(store.acquire_lock(id, ceiling, "c").await.unwrap(), LockAcquisition::Busy);

        assert!(store.release_lock(id, "b").await.unwrap());
        assert_eq!(store.acquire_lock(id, ceiling, "c").await.unwrap(), LockAcquisition::Acquired);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lock_from_going_stale() {
        let (store, id) = store_with_payment().await;
        let ceiling = Duration::from_secs(180);

        store.acquire_lock(id, ceiling, "a").await.unwrap();
        store.backdate_lock(id, chrono::Duration::seconds(170)).await;
        assert!(store.renew_lock(id, "a").await.unwrap());

        assert_eq!(store.acquire_lock(id, ceiling, "b").await.unwrap(), LockAcquisition::Busy);
        assert!(!store.renew_lock(id, "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_conditional_status_update() {
        let (store, id) = store_with_payment().await;

        let moved = store
            .set_payment_status(id, &[PaymentStatus::Error], PaymentStatus::Paid, Some(Utc::now()))
            .await
            .unwrap();
        assert!(!moved);

        let moved = store
            .set_payment_status(id, &[PaymentStatus::Pending], PaymentStatus::Expired, None)
            .await
            .unwrap();
        assert!(moved);

        let illegal = store
            .set_payment_status(id, &[PaymentStatus::Expired], PaymentStatus::Paid, None)
            .await;
        assert!(illegal.is_err());
    }

    #[tokio::test]
    async fn test_discrepancies_detect_both_directions() {
        let (store, id) = store_with_payment().await;
        let payment = store.get_payment(id).await.unwrap().unwrap().payment;

        store.force_status(id, PaymentStatus::Paid).await;
        let found = store.audit_discrepancies().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, DiscrepancyKind::PaidWithoutAudit);

        store.force_status(id, PaymentStatus::Error).await;
        store
            .insert_transaction(NewTransaction::for_payment(&payment, serde_json::json!({}), true))
            .await
            .unwrap();
        let found = store.audit_discrepancies().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, DiscrepancyKind::CreditedNotPaid);

        store.force_status(id, PaymentStatus::Paid).await;
        assert!(store.audit_discrepancies().await.unwrap().is_empty());
    }
}
