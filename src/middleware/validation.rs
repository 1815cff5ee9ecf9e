use axum::{
    body::Body,
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Validation error: {0}")]
    InvalidInput(String),
}

impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        let ValidationError::InvalidInput(msg) = self;

        let body = serde_json::json!({
            "error": msg,
            "error_code": "INVALID_INPUT",
        });

        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

/// Rejects bodies that do not deserialize into `T` or fail its `validator` rules
pub async fn validate_json<T: DeserializeOwned + Validate>(
    req: Request,
    next: Next,
) -> Result<impl IntoResponse, ValidationError> {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| ValidationError::InvalidInput("Invalid request body".to_string()))?;

    check_body::<T>(&bytes)?;

    // Rebuild the request with the validated body
    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}

fn check_body<T: DeserializeOwned + Validate>(bytes: &[u8]) -> Result<(), ValidationError> {
    let value: T = serde_json::from_slice(bytes)
        .map_err(|e| ValidationError::InvalidInput(format!("Invalid JSON: {}", e)))?;

    value
        .validate()
        .map_err(|e| ValidationError::InvalidInput(format!("Validation failed: {}", describe(&e))))
}

fn describe(errors: &ValidationErrors) -> String {
    let mut fields: Vec<String> = errors
        .field_errors()
        .into_iter()
        .map(|(field, errors)| {
            let messages: Vec<String> = errors
                .iter()
                .map(|e| e.message.as_ref().map(|s| s.to_string()).unwrap_or_default())
                .collect();
            format!("{}: {}", field, messages.join(", "))
        })
        .collect();
    fields.sort();
    fields.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::CreatePaymentRequest;

    #[test]
    fn test_valid_payment_request_passes() {
        let body = br#"{"tenant_id":1,"reseller_type":"koffice","reseller_id":42,"package_id":3,"payer_email":"cliente@example.com"}"#;
        assert!(check_body::<CreatePaymentRequest>(body).is_ok());
    }

    #[test]
    fn test_invalid_fields_are_listed() {
        let body = br#"{"tenant_id":0,"reseller_type":"koffice","reseller_id":42,"package_id":3,"payer_email":"nope"}"#;
        let ValidationError::InvalidInput(msg) = check_body::<CreatePaymentRequest>(body).unwrap_err();
        assert!(msg.contains("payer_email"));
        assert!(msg.contains("tenant_id"));
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        let err = check_body::<CreatePaymentRequest>(b"{not json").unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
    }
}
