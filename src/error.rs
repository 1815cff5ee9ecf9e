use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Panel driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tenant unavailable: {0}")]
    TenantUnavailable(i64),

    #[error("External error: {0}")]
    ExternalError(String),
}

/// Payment gateway errors. These never move a payment out of `pending`.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Gateway returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Gateway call timed out")]
    Timeout,

    #[error("Tenant {0} has no gateway access token configured")]
    MissingCredentials(i64),

    #[error("Invalid gateway response: {0}")]
    InvalidResponse(String),
}

/// Panel driver errors. After approval these become `status = error` plus a failure audit row.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Panel request failed: {0}")]
    Transport(String),

    #[error("Panel rejected the operation: {0}")]
    Rejected(String),

    #[error("CAPTCHA solving failed: {0}")]
    Captcha(String),

    #[error("Panel call timed out after {0}s")]
    Timeout(u64),

    #[error("Missing tenant secret: {0}")]
    MissingSecret(String),
}

/// Errors raised by the reconciliation core itself
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Unknown reseller type: {0}")]
    UnknownPanelKind(String),

    #[error("No {kind} reseller {reseller_id} for tenant {tenant_id}")]
    PanelNotResolved {
        kind: String,
        reseller_id: i64,
        tenant_id: i64,
    },

    #[error("No driver registered for panel kind {0}")]
    DriverNotRegistered(String),

    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                msg,
                None,
            ),
            AppError::TenantUnavailable(tenant_id) => (
                StatusCode::FORBIDDEN,
                "TENANT_UNAVAILABLE",
                "Tenant is inactive or expired".to_string(),
                Some(serde_json::json!({ "tenant_id": tenant_id })),
            ),
            AppError::Gateway(GatewayError::MissingCredentials(tenant_id)) => (
                StatusCode::PRECONDITION_FAILED,
                "GATEWAY_NOT_CONFIGURED",
                "Payment gateway is not configured for this tenant".to_string(),
                Some(serde_json::json!({ "tenant_id": tenant_id })),
            ),
            AppError::Gateway(e) => (
                StatusCode::BAD_GATEWAY,
                "GATEWAY_ERROR",
                e.to_string(),
                None,
            ),
            AppError::Reconcile(ReconcileError::UnknownPanelKind(kind)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "UNKNOWN_RESELLER_TYPE",
                format!("Unknown reseller type: {}", kind),
                Some(serde_json::json!({ "reseller_type": kind })),
            ),
            AppError::Reconcile(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "RECONCILIATION_ERROR",
                e.to_string(),
                None,
            ),
            AppError::Driver(e) => (
                StatusCode::BAD_GATEWAY,
                "PANEL_ERROR",
                e.to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Http(error.to_string())
        }
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(error: reqwest::Error) -> Self {
        DriverError::Transport(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
