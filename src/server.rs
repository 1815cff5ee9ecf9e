use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::{
        handler::{
            check_payment, create_payment, get_payment, get_payment_transactions, health_check,
            list_discrepancies, retry_errors, AppState,
        },
        models::CreatePaymentRequest,
    },
    config::Config,
    middleware::{create_cors_layer, rate_limit_middleware, validate_json, RateLimitLayer},
};

pub fn create_app(state: AppState, config: &Config) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let check_limiter = RateLimitLayer::new(config.check_rate_per_minute, 60);

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                .route(
                    "/payments",
                    post(create_payment)
                        .route_layer(middleware::from_fn(validate_json::<CreatePaymentRequest>)),
                )
                .route("/payments/:id", get(get_payment))
                .route("/payments/:id/transactions", get(get_payment_transactions))
                .route(
                    "/payments/:id/check",
                    post(check_payment).route_layer(middleware::from_fn_with_state(
                        check_limiter,
                        rate_limit_middleware,
                    )),
                )
                .route("/tenants/:tenant_id/retry-errors", post(retry_errors))
                .route("/admin/discrepancies", get(list_discrepancies)),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(create_cors_layer(&config.cors_origins))
                .layer(CompressionLayer::new()),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}
