use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, GatewayError};
use crate::gateway::{PixCharge, PixChargeRequest};
use crate::ledger::models::{NewPayment, PanelKind, Payment, ResellerRef};
use crate::reconciliation::ReconciliationEngine;

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub tenant_id: i64,
    pub reseller: ResellerRef,
    pub package_id: i64,
    pub payer_email: String,
}

/// Opens PIX charges for credit packages and records them as pending payments
pub struct CheckoutService {
    engine: Arc<ReconciliationEngine>,
    pix_expiration: chrono::Duration,
}

impl CheckoutService {
    pub fn new(engine: Arc<ReconciliationEngine>, pix_expiration_minutes: i64) -> Self {
        Self {
            engine,
            pix_expiration: chrono::Duration::minutes(pix_expiration_minutes),
        }
    }

    pub async fn create_payment(&self, request: CheckoutRequest) -> AppResult<(Payment, PixCharge)> {
        let store = self.engine.store();
        info!(
            "Creating payment: tenant {} {} reseller {} package {}",
            request.tenant_id, request.reseller.kind, request.reseller.id, request.package_id
        );

        // VALIDATION 1: tenant must be able to sell
        let tenant = store
            .tenant(request.tenant_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("tenant {}", request.tenant_id)))?;
        if !tenant.is_operational_at(Utc::now()) {
            warn!("Rejected payment for inactive tenant {}", tenant.id);
            return Err(AppError::TenantUnavailable(tenant.id));
        }

        // VALIDATION 2: package belongs to this tenant, is on sale and targets this panel kind
        let package = store
            .package(request.tenant_id, request.package_id)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| AppError::NotFound(format!("package {}", request.package_id)))?;
        let package_kind: PanelKind = package.panel_type.parse()?;
        if package_kind != request.reseller.kind {
            return Err(AppError::InvalidInput(format!(
                "package {} is for {} panels, not {}",
                package.id, package_kind, request.reseller.kind
            )));
        }

        // VALIDATION 3: reseller resolves inside the tenant
        let panel = store
            .resolve_panel(request.reseller, request.tenant_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("{} reseller {}", request.reseller.kind, request.reseller.id))
            })?;

        let token = self.engine.gateway_token(request.tenant_id).await?;
        let expires_at = Utc::now() + self.pix_expiration;
        let external_reference = format!(
            "{}-{}-{}-{}",
            request.tenant_id,
            request.reseller.kind,
            request.reseller.id,
            Uuid::new_v4().simple()
        );

        let charge_request = PixChargeRequest {
            amount: package.price,
            description: format!("{} - {} créditos ({})", package.name, package.credits, panel.username),
            payer_email: request.payer_email,
            external_reference,
            expires_at,
        };

        let charge = tokio::time::timeout(
            self.engine.config().gateway_timeout(),
            self.engine.gateway().create_pix_charge(&token, &charge_request),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;

        let payment = store
            .create_payment(NewPayment {
                tenant_id: request.tenant_id,
                reseller_id: request.reseller.id,
                reseller_type: request.reseller.kind.as_str().to_string(),
                package_id: Some(package.id),
                credits: package.credits,
                amount: package.price,
                external_id: charge.external_id.clone(),
                qr_code: charge.qr_code.clone(),
                expires_at: Some(expires_at),
            })
            .await?;

        info!("Payment {} created (charge {})", payment.id, charge.external_id);
        Ok((payment, charge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcileConfig;
    use crate::gateway::{ChargeStatus, PaymentGateway};
    use crate::ledger::models::*;
    use crate::ledger::{MemoryPaymentStore, PaymentStore};
    use crate::panels::DriverRegistry;
    use crate::reconciliation::InFlightRegistry;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct FixedGateway;

    #[async_trait]
    impl PaymentGateway for FixedGateway {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn create_pix_charge(&self, _access_token: &str, request: &PixChargeRequest) -> Result<PixCharge, GatewayError> {
            assert_eq!(request.amount, dec!(49.90));
            Ok(PixCharge {
                external_id: "1319873921".to_string(),
                qr_code: "00020126580014br.gov.bcb.pix".to_string(),
                qr_code_base64: None,
                status: ChargeStatus::from_raw("pending"),
            })
        }

        async fn get_status(&self, _access_token: &str, _external_id: &str) -> Result<ChargeStatus, GatewayError> {
            Ok(ChargeStatus::from_raw("pending"))
        }
    }

    async fn service() -> (Arc<MemoryPaymentStore>, CheckoutService) {
        let store = Arc::new(MemoryPaymentStore::new());
        store
            .insert_tenant(Tenant {
                id: 1,
                name: "Loja".to_string(),
                status: TenantStatus::Active,
                expires_at: None,
            })
            .await;
        store.set_tenant_config(1, config_keys::GATEWAY_ACCESS_TOKEN, "token").await;
        store
            .insert_panel(
                PanelKind::Koffice,
                PanelRecord {
                    id: 1,
                    tenant_id: 1,
                    url: "https://ko.example".to_string(),
                    admin_username: "admin".to_string(),
                    admin_password: "pw".to_string(),
                    has_captcha: true,
                    captcha_site_key: Some("site".to_string()),
                },
            )
            .await;
        store
            .insert_reseller(
                PanelKind::Koffice,
                ResellerRecord {
                    id: 42,
                    tenant_id: 1,
                    panel_id: 1,
                    username: "revenda42".to_string(),
                    account_id: "ko-42".to_string(),
                    status: "active".to_string(),
                },
            )
            .await;
        store
            .insert_package(CreditPackage {
                id: 3,
                tenant_id: 1,
                panel_type: "koffice".to_string(),
                name: "Pacote 100".to_string(),
                credits: 100,
                price: dec!(49.90),
                active: true,
            })
            .await;

        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            Arc::new(FixedGateway),
            Arc::new(DriverRegistry::new()),
            Arc::new(InFlightRegistry::new()),
            ReconcileConfig::default(),
        ));
        (store, CheckoutService::new(engine, 30))
    }

    fn request(kind: PanelKind, package_id: i64) -> CheckoutRequest {
        CheckoutRequest {
            tenant_id: 1,
            reseller: ResellerRef::new(kind, 42),
            package_id,
            payer_email: "cliente@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_creates_pending_payment_from_package() {
        let (store, service) = service().await;

        let (payment, charge) = service.create_payment(request(PanelKind::Koffice, 3)).await.unwrap();

        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.credits, 100);
        assert_eq!(payment.amount, dec!(49.90));
        assert_eq!(payment.reseller_type, "koffice");
        assert_eq!(payment.external_id, charge.external_id);
        assert!(payment.expires_at.is_some());
        assert_eq!(store.pending_payments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_package_for_other_panel_kind() {
        let (_, service) = service().await;
        let err = service.create_payment(request(PanelKind::Sigma, 3)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_unknown_package_is_not_found() {
        let (_, service) = service().await;
        let err = service.create_payment(request(PanelKind::Koffice, 99)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
