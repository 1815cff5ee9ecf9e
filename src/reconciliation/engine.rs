use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::guard::InFlightRegistry;
use crate::config::ReconcileConfig;
use crate::error::{AppError, AppResult, DriverError, GatewayError, ReconcileError};
use crate::gateway::{ChargeStatus, PaymentGateway, Settlement};
use crate::ledger::models::{
    config_keys, LockAcquisition, NewTransaction, PanelContext, Payment, PaymentStatus,
    ResellerRef,
};
use crate::ledger::PaymentStore;
use crate::panels::{CreditOutcome, DriverRegistry, DriverSecrets, RetryPolicy};

/// What happened to a payment during one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Driver succeeded; payment is now `paid`
    Credited,
    /// Driver failed; payment is now `error`
    CreditFailed,
    AlreadyProcessed,
    StillProcessing,
    TenantUnavailable,
    PaymentExpired,
    /// Gateway reported the charge void; payment is now `expired`
    Voided,
    /// Gateway has not approved the charge yet
    AwaitingPayment,
}

impl ReconcileOutcome {
    /// Whether the payment ends up credited
    pub fn is_success(&self) -> bool {
        matches!(self, ReconcileOutcome::Credited | ReconcileOutcome::AlreadyProcessed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub payment_id: i64,
    pub outcome: ReconcileOutcome,
    /// Status after this pass, when known
    pub status: Option<PaymentStatus>,
    pub message: String,
}

impl ReconcileReport {
    fn new(
        payment_id: i64,
        outcome: ReconcileOutcome,
        status: Option<PaymentStatus>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            payment_id,
            outcome,
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkRetryItem {
    pub payment_id: i64,
    pub succeeded: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkRetryReport {
    pub tenant_id: i64,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<BulkRetryItem>,
}

/// Confirms payments with the gateway and credits resellers through their panel driver.
///
/// Every credit goes through [`ReconciliationEngine::dispatch`], which holds the
/// persisted processing lock, re-reads the payment inside it and writes the
/// outcome and its audit row atomically.
pub struct ReconciliationEngine {
    store: Arc<dyn PaymentStore>,
    gateway: Arc<dyn PaymentGateway>,
    drivers: Arc<DriverRegistry>,
    inflight: Arc<InFlightRegistry>,
    config: ReconcileConfig,
    retry_policy: RetryPolicy,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        drivers: Arc<DriverRegistry>,
        inflight: Arc<InFlightRegistry>,
        config: ReconcileConfig,
    ) -> Self {
        let retry_policy = RetryPolicy::from(&config);
        Self {
            store,
            gateway,
            drivers,
            inflight,
            config,
            retry_policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn PaymentStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    pub fn inflight(&self) -> &Arc<InFlightRegistry> {
        &self.inflight
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Asks the gateway about a charge using the tenant's own access token
    pub async fn gateway_status(&self, payment: &Payment) -> AppResult<ChargeStatus> {
        let token = self.gateway_token(payment.tenant_id).await?;

        let status = tokio::time::timeout(
            self.config.gateway_timeout(),
            self.gateway.get_status(&token, &payment.external_id),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;

        Ok(status)
    }

    pub async fn gateway_token(&self, tenant_id: i64) -> AppResult<String> {
        let token = self
            .store
            .tenant_config(tenant_id, config_keys::GATEWAY_ACCESS_TOKEN)
            .await?
            .filter(|t| !t.is_empty())
            .ok_or(GatewayError::MissingCredentials(tenant_id))?;
        Ok(token)
    }

    /// Poller path: confirm a pending payment with the gateway, then act on the answer
    #[instrument(skip(self, payment), fields(payment_id = payment.id, tenant_id = payment.tenant_id))]
    pub async fn confirm_and_dispatch(&self, payment: &Payment) -> AppResult<ReconcileReport> {
        let charge = match self.gateway_status(payment).await {
            Ok(charge) => charge,
            Err(e) => {
                warn!("Gateway check failed for payment {}, will retry: {}", payment.id, e);
                return Err(e);
            }
        };

        self.apply_gateway_status(payment, &charge).await
    }

    async fn apply_gateway_status(&self, payment: &Payment, charge: &ChargeStatus) -> AppResult<ReconcileReport> {
        match charge.status.settlement() {
            Settlement::Approved => {
                info!("Payment {} approved by gateway, dispatching credits", payment.id);
                self.dispatch(payment.id).await
            }
            Settlement::Void => self.expire(payment, &charge.raw).await,
            Settlement::Open => Ok(ReconcileReport::new(
                payment.id,
                ReconcileOutcome::AwaitingPayment,
                Some(payment.status),
                format!("Gateway status: {}", charge.raw),
            )),
        }
    }

    async fn expire(&self, payment: &Payment, raw_status: &str) -> AppResult<ReconcileReport> {
        let changed = self
            .store
            .set_payment_status(
                payment.id,
                &PaymentStatus::sources_of(PaymentStatus::Expired),
                PaymentStatus::Expired,
                None,
            )
            .await?;

        if changed {
            info!("Payment {} expired (gateway status {})", payment.id, raw_status);
            Ok(ReconcileReport::new(
                payment.id,
                ReconcileOutcome::Voided,
                Some(PaymentStatus::Expired),
                format!("Payment {} at the gateway", raw_status),
            ))
        } else {
            let current = self.store.get_payment(payment.id).await?.map(|row| row.payment.status);
            Ok(ReconcileReport::new(
                payment.id,
                ReconcileOutcome::AlreadyProcessed,
                current,
                "Payment changed state before it could be expired",
            ))
        }
    }

    /// Credits an approved payment under the persisted processing lock.
    ///
    /// The lock is refreshed on a heartbeat for as long as the guarded work runs,
    /// so a slow panel never looks abandoned to another process. It is released
    /// on every path out, and only if this dispatch still holds it.
    #[instrument(skip(self))]
    pub async fn dispatch(&self, payment_id: i64) -> AppResult<ReconcileReport> {
        let token = Uuid::new_v4().to_string();

        match self
            .store
            .acquire_lock(payment_id, self.config.lock_ceiling(), &token)
            .await?
        {
            LockAcquisition::Busy => {
                info!("Payment {} is still processing elsewhere", payment_id);
                return Ok(ReconcileReport::new(
                    payment_id,
                    ReconcileOutcome::StillProcessing,
                    None,
                    "Payment is still being processed",
                ));
            }
            LockAcquisition::Stolen => {
                warn!(
                    "Processing lock on payment {} missed its heartbeat for {}s, taking it over",
                    payment_id, self.config.lock_ceiling_secs
                );
            }
            LockAcquisition::Acquired => {}
        }

        let result = self.with_heartbeat(payment_id, &token, self.dispatch_locked(payment_id)).await;

        match self.store.release_lock(payment_id, &token).await {
            Ok(true) => {}
            Ok(false) => error!("Processing lock on payment {} was taken over before release", payment_id),
            Err(e) => error!("Failed to release processing lock on payment {}: {}", payment_id, e),
        }

        result
    }

    /// Drives `work` to completion while renewing the lock held by `token`
    async fn with_heartbeat<F>(&self, payment_id: i64, token: &str, work: F) -> F::Output
    where
        F: Future,
    {
        tokio::pin!(work);
        let mut heartbeat = interval(self.config.lock_heartbeat());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = heartbeat.tick() => match self.store.renew_lock(payment_id, token).await {
                    Ok(true) => debug!("Processing lock on payment {} renewed", payment_id),
                    Ok(false) => error!("Processing lock on payment {} lost while crediting", payment_id),
                    Err(e) => warn!("Failed to renew processing lock on payment {}: {}", payment_id, e),
                },
            }
        }
    }

    async fn dispatch_locked(&self, payment_id: i64) -> AppResult<ReconcileReport> {
        let row = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payment {}", payment_id)))?;
        let payment = row.payment;

        match payment.status {
            PaymentStatus::Paid => {
                info!("Payment {} already processed", payment_id);
                return Ok(ReconcileReport::new(
                    payment_id,
                    ReconcileOutcome::AlreadyProcessed,
                    Some(PaymentStatus::Paid),
                    "Payment already processed",
                ));
            }
            PaymentStatus::Expired => {
                return Ok(ReconcileReport::new(
                    payment_id,
                    ReconcileOutcome::PaymentExpired,
                    Some(PaymentStatus::Expired),
                    "Payment expired",
                ));
            }
            PaymentStatus::Pending | PaymentStatus::Error => {}
        }

        let ctx = match self.resolve_context(&payment, row.panel) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("Payment {} cannot be routed to a panel: {}", payment_id, e);
                self.record_failure(&payment, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        let factory = match self.drivers.get(ctx.kind) {
            Ok(factory) => factory,
            Err(e) => {
                error!("Payment {}: {}", payment_id, e);
                self.record_failure(&payment, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        let mut secrets = DriverSecrets::new();
        for key in factory.required_secrets(&ctx) {
            if let Some(value) = self.store.tenant_config(ctx.tenant_id, key).await? {
                secrets.insert(key, value);
            }
        }

        let attempt = match factory.build(&ctx, &secrets) {
            Ok(driver) => {
                let budget = self.config.driver_budget();
                match tokio::time::timeout(
                    budget,
                    driver.add_credits_with_retry(&ctx.account_id, payment.credits, &self.retry_policy),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(DriverError::Timeout(budget.as_secs())),
                }
            }
            Err(e) => Err(e),
        };

        match attempt {
            Ok(outcome) => self.record_success(&payment, &ctx, outcome).await,
            Err(e) => {
                warn!("Crediting payment {} on {} failed: {}", payment_id, ctx.kind, e);
                self.record_failure(&payment, &e.to_string()).await?;
                Ok(ReconcileReport::new(
                    payment_id,
                    ReconcileOutcome::CreditFailed,
                    Some(PaymentStatus::Error),
                    e.to_string(),
                ))
            }
        }
    }

    /// Maps the stored discriminator onto a panel context. Unknown kinds and
    /// unresolvable resellers are both routing failures.
    fn resolve_context(&self, payment: &Payment, panel: Option<PanelContext>) -> Result<PanelContext, ReconcileError> {
        let reference: ResellerRef = payment.reseller_ref()?;
        panel
            .filter(|ctx| ctx.kind == reference.kind && ctx.tenant_id == payment.tenant_id)
            .ok_or_else(|| ReconcileError::PanelNotResolved {
                kind: reference.kind.to_string(),
                reseller_id: reference.id,
                tenant_id: payment.tenant_id,
            })
    }

    async fn record_success(
        &self,
        payment: &Payment,
        ctx: &PanelContext,
        outcome: CreditOutcome,
    ) -> AppResult<ReconcileReport> {
        let response = json!({
            "success": true,
            "message": outcome.message,
            "panel_type": ctx.kind,
            "panel": outcome.response,
        });

        let recorded = self
            .store
            .record_outcome(
                payment.id,
                &PaymentStatus::sources_of(PaymentStatus::Paid),
                PaymentStatus::Paid,
                Some(Utc::now()),
                NewTransaction::for_payment(payment, response, true),
            )
            .await?;

        if !recorded {
            let current = self.store.get_payment(payment.id).await?.map(|row| row.payment.status);
            error!(
                "Payment {} was credited but had already left its retryable state ({:?}); audit row kept",
                payment.id, current
            );
            return Ok(ReconcileReport::new(
                payment.id,
                ReconcileOutcome::AlreadyProcessed,
                current,
                "Payment changed state while it was being credited",
            ));
        }

        info!(
            "Payment {} credited: {} credits to {} on {}",
            payment.id, payment.credits, ctx.username, ctx.kind
        );
        Ok(ReconcileReport::new(
            payment.id,
            ReconcileOutcome::Credited,
            Some(PaymentStatus::Paid),
            format!("{} credits added to {}", payment.credits, ctx.username),
        ))
    }

    async fn record_failure(&self, payment: &Payment, reason: &str) -> AppResult<()> {
        let response = json!({
            "success": false,
            "error": reason,
            "panel_type": payment.reseller_type,
        });

        let recorded = self
            .store
            .record_outcome(
                payment.id,
                &PaymentStatus::sources_of(PaymentStatus::Error),
                PaymentStatus::Error,
                None,
                NewTransaction::for_payment(payment, response, false),
            )
            .await?;

        if !recorded {
            warn!("Payment {} left its retryable state before the failure was recorded", payment.id);
        }
        Ok(())
    }

    /// Manual check/retry of one payment.
    ///
    /// Informational rejections (already paid, expired, tenant unavailable,
    /// still processing) come back as reports, not errors.
    #[instrument(skip(self))]
    pub async fn check_payment(&self, payment_id: i64) -> AppResult<ReconcileReport> {
        let row = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payment {}", payment_id)))?;
        let payment = row.payment;

        if payment.status == PaymentStatus::Paid {
            return Ok(ReconcileReport::new(
                payment_id,
                ReconcileOutcome::AlreadyProcessed,
                Some(PaymentStatus::Paid),
                "Payment already processed",
            ));
        }

        let operational = self
            .store
            .tenant(payment.tenant_id)
            .await?
            .map(|tenant| tenant.is_operational_at(Utc::now()))
            .unwrap_or(false);
        if !operational {
            info!("Tenant {} is inactive or expired, skipping payment {}", payment.tenant_id, payment_id);
            return Ok(ReconcileReport::new(
                payment_id,
                ReconcileOutcome::TenantUnavailable,
                Some(payment.status),
                "Tenant is inactive or expired",
            ));
        }

        if payment.status == PaymentStatus::Expired {
            return Ok(ReconcileReport::new(
                payment_id,
                ReconcileOutcome::PaymentExpired,
                Some(PaymentStatus::Expired),
                "Payment expired",
            ));
        }

        let _claim = match self.inflight.claim(payment_id) {
            Some(claim) => claim,
            None => {
                info!("Payment {} is already in flight", payment_id);
                return Ok(ReconcileReport::new(
                    payment_id,
                    ReconcileOutcome::StillProcessing,
                    Some(payment.status),
                    "Payment is still being processed",
                ));
            }
        };

        match payment.status {
            PaymentStatus::Pending => {
                let charge = self.gateway_status(&payment).await?;
                self.apply_gateway_status(&payment, &charge).await
            }
            _ => self.dispatch(payment_id).await,
        }
    }

    /// Retries every `error` payment of a tenant, optionally narrowed to one reseller.
    /// Items run sequentially; one item's failure never stops the rest.
    #[instrument(skip(self))]
    pub async fn retry_errors(&self, tenant_id: i64, reseller: Option<ResellerRef>) -> AppResult<BulkRetryReport> {
        let ids = self.store.error_payments(tenant_id, reseller).await?;
        let total = ids.len();
        info!("Retrying {} errored payments for tenant {}", total, tenant_id);

        let mut items = Vec::with_capacity(total);
        for (index, payment_id) in ids.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.bulk_retry_delay()).await;
            }

            let item = match self.check_payment(payment_id).await {
                Ok(report) => BulkRetryItem {
                    payment_id,
                    succeeded: report.outcome.is_success(),
                    message: report.message,
                },
                Err(e) => {
                    warn!("Retry of payment {} failed: {}", payment_id, e);
                    BulkRetryItem {
                        payment_id,
                        succeeded: false,
                        message: e.to_string(),
                    }
                }
            };
            items.push(item);
        }

        let succeeded = items.iter().filter(|item| item.succeeded).count();
        let report = BulkRetryReport {
            tenant_id,
            total,
            succeeded,
            failed: total - succeeded,
            items,
        };

        info!(
            "Bulk retry for tenant {} finished: {} succeeded, {} failed",
            tenant_id, report.succeeded, report.failed
        );
        Ok(report)
    }
}
