//! Error kinds surfaced by the authority node.
//!
//! Validation failures map to stable 4xx statuses; accounting violations and
//! unexpected infrastructure failures are 5xx. The wire carries no error
//! object inside envelopes — errors are HTTP-level with a text body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::amount::Satoshi;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("consensus failure: {0}")]
    Consensus(String),

    #[error("chain view unavailable: {0}")]
    ChainView(String),

    #[error("amount {amount} below minimum {minimum}")]
    AmountTooSmall { amount: Satoshi, minimum: Satoshi },

    #[error("accounting invariant violated: {0}")]
    AccountingInvariantViolated(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("total tax {total_tax} does not cover network fee {network_fee}")]
    InsufficientTaxForFee {
        total_tax: Satoshi,
        network_fee: Satoshi,
    },

    #[error("transaction shape mismatch: {0}")]
    TxShapeMismatch(String),

    #[error("no pending payouts")]
    NothingToPayOut,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::MalformedRequest(_) | Error::AmountTooSmall { .. } => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Duplicate(_) | Error::Consensus(_) | Error::TxShapeMismatch(_) => {
                StatusCode::CONFLICT
            }
            Error::InsufficientFunds(_)
            | Error::InsufficientTaxForFee { .. }
            | Error::NothingToPayOut => StatusCode::BAD_REQUEST,
            Error::ChainView(_) => StatusCode::BAD_GATEWAY,
            Error::AccountingInvariantViolated(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        // UNIQUE violations are duplicate registrations, not server faults.
        if let sqlx::Error::Database(ref db) = e {
            if db.is_unique_violation() {
                return Error::Duplicate(db.to_string());
            }
        }
        Error::Internal(format!("store: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::ChainView(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedRequest(format!("bad json: {e}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
