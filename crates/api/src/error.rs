//! API error type and its HTTP rendering

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use plancap_billing::BillingError;
use serde_json::{json, Value};
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Billing is not configured on this server")]
    BillingDisabled,

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Value) {
        match self {
            ApiError::Billing(err) => billing_parts(err),
            ApiError::BillingDisabled => {
                (StatusCode::SERVICE_UNAVAILABLE, "billing_disabled", json!({}))
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", json!({})),
        }
    }
}

/// Status, machine-readable code and structured details for a billing error
fn billing_parts(err: &BillingError) -> (StatusCode, &'static str, Value) {
    match err {
        BillingError::Unauthorized { .. } => (StatusCode::FORBIDDEN, "forbidden", json!({})),
        BillingError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", json!({})),
        BillingError::SeatLimitExceeded(limit) => (
            StatusCode::CONFLICT,
            "seat_limit_exceeded",
            json!({
                "current": limit.current,
                "max": limit.max,
                "next_plan": limit.next_plan,
            }),
        ),
        BillingError::DowngradeBlocked(blocked) => (
            StatusCode::CONFLICT,
            "downgrade_blocked",
            json!({
                "target_plan": blocked.target_plan,
                "dimension": blocked.dimension,
                "current": blocked.current,
                "limit": blocked.limit,
                "excess": blocked.excess(),
            }),
        ),
        BillingError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input", json!({})),
        BillingError::ConcurrentModification(_) => {
            (StatusCode::CONFLICT, "concurrent_modification", json!({}))
        }
        BillingError::PaymentMethodRequired => (
            StatusCode::PAYMENT_REQUIRED,
            "payment_method_required",
            json!({}),
        ),
        BillingError::Timeout(_) => {
            (StatusCode::GATEWAY_TIMEOUT, "billing_provider_timeout", json!({}))
        }
        BillingError::ExternalService { .. }
        | BillingError::ProviderUnavailable { .. }
        | BillingError::InvoicePayment { .. } => {
            (StatusCode::BAD_GATEWAY, "billing_provider_error", json!({}))
        }
        BillingError::Database(_) | BillingError::Config(_) | BillingError::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            json!({}),
        ),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, details) = self.parts();

        // Never leak database or configuration details
        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self, code = code, "Request failed");
            match status {
                StatusCode::BAD_GATEWAY => "Billing provider request failed".to_string(),
                StatusCode::GATEWAY_TIMEOUT => "Billing provider timed out".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };

        let mut body = json!({
            "error": message,
            "code": code,
        });
        if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), details) {
            body.extend(extra);
        }

        (status, Json(body)).into_response()
    }
}
