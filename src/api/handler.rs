use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::models::*;
use crate::{
    checkout::{CheckoutRequest, CheckoutService},
    error::{AppError, AppResult},
    ledger::{
        models::{PanelKind, ResellerRef},
        PaymentStore,
    },
    panels::DriverRegistry,
    reconciliation::{AuditSweep, BulkRetryReport, ReconciliationEngine},
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PaymentStore>,
    pub engine: Arc<ReconciliationEngine>,
    pub checkout: Arc<CheckoutService>,
    pub drivers: Arc<DriverRegistry>,
    pub audit: Arc<AuditSweep>,
}

/// Open a PIX charge for a credit package
/// POST /api/v1/payments
pub async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<CreatePaymentRequest>,
) -> AppResult<(StatusCode, Json<PaymentResponse>)> {
    let kind: PanelKind = request.reseller_type.parse()?;

    let (payment, charge) = state
        .checkout
        .create_payment(CheckoutRequest {
            tenant_id: request.tenant_id,
            reseller: ResellerRef::new(kind, request.reseller_id),
            package_id: request.package_id,
            payer_email: request.payer_email,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(PaymentResponse::with_charge(payment, charge))))
}

/// GET /api/v1/payments/:id
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<i64>,
) -> AppResult<Json<PaymentResponse>> {
    let row = state
        .store
        .get_payment(payment_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("payment {}", payment_id)))?;

    Ok(Json(PaymentResponse::from(row.payment)))
}

/// Audit trail of every reconciliation attempt
/// GET /api/v1/payments/:id/transactions
pub async fn get_payment_transactions(
    State(state): State<AppState>,
    Path(payment_id): Path<i64>,
) -> AppResult<Json<TransactionsResponse>> {
    if state.store.get_payment(payment_id).await?.is_none() {
        return Err(AppError::NotFound(format!("payment {}", payment_id)));
    }

    let transactions = state.store.transactions_for_payment(payment_id).await?;
    Ok(Json(TransactionsResponse {
        payment_id,
        transactions,
    }))
}

/// Manual check / retry of one payment
/// POST /api/v1/payments/:id/check
pub async fn check_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<i64>,
) -> AppResult<Json<CheckResponse>> {
    info!("Manual check requested for payment {}", payment_id);
    let report = state.engine.check_payment(payment_id).await?;
    Ok(Json(CheckResponse::from(report)))
}

/// Retry every errored payment of a tenant
/// POST /api/v1/tenants/:tenant_id/retry-errors
pub async fn retry_errors(
    State(state): State<AppState>,
    Path(tenant_id): Path<i64>,
    Query(query): Query<RetryErrorsQuery>,
) -> AppResult<Json<BulkRetryReport>> {
    let reseller = reseller_filter(&query)?;

    if state.store.tenant(tenant_id).await?.is_none() {
        return Err(AppError::NotFound(format!("tenant {}", tenant_id)));
    }

    let report = state.engine.retry_errors(tenant_id, reseller).await?;
    Ok(Json(report))
}

pub fn reseller_filter(query: &RetryErrorsQuery) -> AppResult<Option<ResellerRef>> {
    match (&query.reseller_type, query.reseller_id) {
        (Some(kind), Some(id)) => Ok(Some(ResellerRef::new(kind.parse()?, id))),
        (None, None) => Ok(None),
        _ => Err(AppError::InvalidInput(
            "reseller_type and reseller_id must be given together".to_string(),
        )),
    }
}

/// Payments whose status disagrees with their audit trail
/// GET /api/v1/admin/discrepancies
pub async fn list_discrepancies(State(state): State<AppState>) -> AppResult<Json<DiscrepanciesResponse>> {
    let discrepancies = state.audit.run_once().await?;
    Ok(Json(DiscrepanciesResponse {
        count: discrepancies.len(),
        discrepancies,
    }))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut panel_kinds: Vec<String> = state
        .drivers
        .registered_kinds()
        .into_iter()
        .map(|kind| kind.to_string())
        .collect();
    panel_kinds.sort();

    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        in_flight: state.engine.inflight().len(),
        panel_kinds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconcileError;

    #[test]
    fn test_reseller_filter_requires_both_fields() {
        let none = RetryErrorsQuery::default();
        assert!(reseller_filter(&none).unwrap().is_none());

        let both = RetryErrorsQuery {
            reseller_type: Some("Koffice".to_string()),
            reseller_id: Some(42),
        };
        assert_eq!(
            reseller_filter(&both).unwrap(),
            Some(ResellerRef::new(PanelKind::Koffice, 42))
        );

        let partial = RetryErrorsQuery {
            reseller_type: None,
            reseller_id: Some(42),
        };
        assert!(matches!(reseller_filter(&partial), Err(AppError::InvalidInput(_))));

        let unknown = RetryErrorsQuery {
            reseller_type: Some("netflix".to_string()),
            reseller_id: Some(1),
        };
        assert!(matches!(
            reseller_filter(&unknown),
            Err(AppError::Reconcile(ReconcileError::UnknownPanelKind(_)))
        ));
    }
}
