use std::{sync::Arc, time::Duration};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    checkout::CheckoutService,
    config::Config,
    error::{AppError, AppResult},
    gateway::MercadoPagoGateway,
    ledger::{MemoryPaymentStore, PaymentStore, PgPaymentStore},
    panels::{AutomationDriverFactory, DriverRegistry, TwoCaptchaSolver},
    reconciliation::{AuditSweep, InFlightRegistry, Poller, ReconciliationEngine},
};

/// Everything the binary needs: HTTP state plus the background workers
pub struct Runtime {
    pub state: AppState,
    pub poller: Arc<Poller>,
    pub audit: Arc<AuditSweep>,
}

pub async fn initialize(config: &Config) -> AppResult<Runtime> {
    info!("Initializing application components ...");

    let store: Arc<dyn PaymentStore> = match config.store.as_str() {
        "postgres" => Arc::new(PgPaymentStore::new(initialize_database(&config.database_url).await?)),
        "memory" => {
            warn!("⚠️  Using the in-memory store - nothing survives a restart");
            Arc::new(MemoryPaymentStore::new())
        }
        other => return Err(AppError::Config(format!("unknown STORE '{}'", other))),
    };

    let reconcile = &config.reconcile;
    info!(
        "🔒 Processing lock ceiling {}s, heartbeat every {}ms",
        reconcile.lock_ceiling_secs,
        reconcile.lock_heartbeat().as_millis()
    );

    let gateway = Arc::new(MercadoPagoGateway::new(
        config.mercadopago_api_url.clone(),
        reconcile.gateway_timeout(),
    )?);
    info!("✅ Mercado Pago gateway at {}", config.mercadopago_api_url);

    let solver = Arc::new(TwoCaptchaSolver::new(
        config.captcha_api_url.clone(),
        config.captcha_poll_attempts,
        Duration::from_secs(config.captcha_poll_interval_secs),
    )?);
    let client = AutomationDriverFactory::http_client(Duration::from_secs(reconcile.driver_timeout_secs))?;
    let drivers = Arc::new(DriverRegistry::with_automation(client, &config.automation_url, solver));
    info!("✅ {} panel drivers registered", drivers.registered_kinds().len());

    let engine = Arc::new(ReconciliationEngine::new(
        store.clone(),
        gateway,
        drivers.clone(),
        Arc::new(InFlightRegistry::new()),
        reconcile.clone(),
    ));

    let checkout = Arc::new(CheckoutService::new(engine.clone(), config.pix_expiration_minutes));
    let audit = Arc::new(AuditSweep::new(
        store.clone(),
        Duration::from_secs(reconcile.audit_sweep_interval_secs),
    ));
    let poller = Arc::new(Poller::new(engine.clone()));

    let state = AppState {
        store,
        engine,
        checkout,
        drivers,
        audit: audit.clone(),
    };

    Ok(Runtime { state, poller, audit })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
