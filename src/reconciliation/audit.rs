use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use super::poller::TaskHandle;
use crate::error::AppResult;
use crate::ledger::models::{Discrepancy, DiscrepancyKind};
use crate::ledger::PaymentStore;

/// Read-only sweep comparing payment status with the audit trail.
/// Anything it finds needs an operator; it never changes a payment.
pub struct AuditSweep {
    store: Arc<dyn PaymentStore>,
    period: Duration,
}

impl AuditSweep {
    pub fn new(store: Arc<dyn PaymentStore>, period: Duration) -> Self {
        Self { store, period }
    }

    pub async fn run_once(&self) -> AppResult<Vec<Discrepancy>> {
        let found = self.store.audit_discrepancies().await?;

        for item in &found {
            match item.kind {
                DiscrepancyKind::PaidWithoutAudit => error!(
                    "Payment {} (tenant {}) is paid but has no successful audit row",
                    item.payment_id, item.tenant_id
                ),
                DiscrepancyKind::CreditedNotPaid => error!(
                    "Payment {} (tenant {}) was credited {} time(s) but is {}",
                    item.payment_id, item.tenant_id, item.successful_attempts, item.status
                ),
            }
        }

        info!("Audit sweep finished: {} discrepancies", found.len());
        Ok(found)
    }

    pub fn start(self: Arc<Self>) -> TaskHandle {
        TaskHandle::spawn(move |mut shutdown| async move {
            let mut ticker = interval(self.period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!("Audit sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
