//! Billing error types

use thiserror::Error;
use uuid::Uuid;

use crate::seats::{DowngradeBlocked, SeatLimitExceeded};

/// Errors raised by seat accounting and plan transitions
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("User {user_id} is not an owner of workspace {workspace_id}")]
    Unauthorized { workspace_id: Uuid, user_id: Uuid },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    SeatLimitExceeded(SeatLimitExceeded),

    #[error("{0}")]
    DowngradeBlocked(DowngradeBlocked),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Billing provider error during {operation}: {message}")]
    ExternalService {
        operation: &'static str,
        message: String,
    },

    #[error("Invoice {invoice_id} could not be paid: {message}")]
    InvoicePayment { invoice_id: String, message: String },

    #[error("Payment method required to complete this change")]
    PaymentMethodRequired,

    #[error("Billing provider unavailable during {operation}: {message}")]
    ProviderUnavailable {
        operation: &'static str,
        message: String,
    },

    #[error("Billing provider call timed out during {0}")]
    Timeout(&'static str),

    #[error("Concurrent modification, retry the operation: {0}")]
    ConcurrentModification(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// True when the failure came from the billing provider rather than local state
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Self::ExternalService { .. }
                | Self::ProviderUnavailable { .. }
                | Self::Timeout(_)
                | Self::PaymentMethodRequired
        )
    }

    /// Failures worth retrying against the billing provider
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderUnavailable { .. } | Self::Timeout(_))
    }

    /// Classify a Stripe error raised while performing `operation`
    pub fn from_stripe(operation: &'static str, err: stripe::StripeError) -> Self {
        match &err {
            stripe::StripeError::Stripe(request_error)
                if request_error.http_status == 429
                    || (500..600).contains(&request_error.http_status) =>
            {
                Self::ProviderUnavailable {
                    operation,
                    message: err.to_string(),
                }
            }
            stripe::StripeError::Timeout => Self::Timeout(operation),
            _ => {
                let message = err.to_string();
                if message.contains("no attached payment source")
                    || message.contains("no default payment method")
                {
                    return Self::PaymentMethodRequired;
                }
                Self::ExternalService { operation, message }
            }
        }
    }
}

/// Result type for billing operations
pub type BillingResult<T> = Result<T, BillingError>;

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            // 40001 serialization_failure, 40P01 deadlock_detected
            if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
                return Self::ConcurrentModification(db_err.message().to_string());
            }
        }
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        Self::from_stripe("stripe", err)
    }
}
