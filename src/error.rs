use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::responses::RequestMeta;
use crate::types::TransactionStatus;

pub const E_BAD_AMOUNT: &str = "BAD_AMOUNT";
pub const E_BALANCE_LIMIT: &str = "BALANCE_LIMIT";
pub const E_INVALID_LOCATION: &str = "INVALID_LOCATION";
pub const E_OUT_OF_RANGE: &str = "OUT_OF_RANGE";
pub const E_INVALID_TRANSITION: &str = "INVALID_TRANSITION";
pub const E_INSUFFICIENT_BALANCE: &str = "INSUFFICIENT_BALANCE";
pub const E_DATA_UNAVAILABLE: &str = "DATA_UNAVAILABLE";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_BAD_RANGE: &str = "BAD_RANGE";

/// Expected, recoverable outcomes of ledger, geofence and metrics operations.
///
/// Every variant leaves stored entities in their last valid state.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("reported location is missing or malformed")]
    InvalidLocation,

    #[error("location is not within range of any store")]
    OutOfRange,

    #[error("transaction {id} is already {status}")]
    InvalidTransition { id: Uuid, status: TransactionStatus },

    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },

    #[error("amount must be greater than zero and at most 9999999999.99")]
    InvalidAmount,

    #[error("settling would take the balance of customer {0} past its limit")]
    BalanceLimit(Uuid),

    #[error("customer not found: {0}")]
    CustomerNotFound(Uuid),

    #[error("transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error("data source unavailable, try again later")]
    DataUnavailable,
}

impl LedgerError {
    /// Wraps a collaborator failure. The cause chain goes to the log only.
    pub fn unavailable(err: anyhow::Error) -> Self {
        error!("data source failure: {:?}", err);
        LedgerError::DataUnavailable
    }

    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidLocation => E_INVALID_LOCATION,
            LedgerError::OutOfRange => E_OUT_OF_RANGE,
            LedgerError::InvalidTransition { .. } => E_INVALID_TRANSITION,
            LedgerError::InsufficientBalance { .. } => E_INSUFFICIENT_BALANCE,
            LedgerError::InvalidAmount => E_BAD_AMOUNT,
            LedgerError::BalanceLimit(_) => E_BALANCE_LIMIT,
            LedgerError::CustomerNotFound(_) | LedgerError::TransactionNotFound(_) => E_NOT_FOUND,
            LedgerError::DataUnavailable => E_DATA_UNAVAILABLE,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Unavailable(String),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let msg = err.to_string();
        match err {
            LedgerError::InvalidLocation | LedgerError::InvalidAmount => ApiError::BadRequest(msg),
            LedgerError::OutOfRange => ApiError::Unprocessable(msg),
            LedgerError::InvalidTransition { .. }
            | LedgerError::InsufficientBalance { .. }
            | LedgerError::BalanceLimit(_) => ApiError::Conflict(msg),
            LedgerError::CustomerNotFound(_) | LedgerError::TransactionNotFound(_) => {
                ApiError::NotFound(msg)
            }
            LedgerError::DataUnavailable => ApiError::Unavailable(msg),
        }
    }
}

impl LedgerError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        let code = self.code();
        ApiError::from(self).with_meta(meta).with_code(code)
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Unavailable(msg) => {
                error!("request {} failed: {}", self.meta.request_id, msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}
