//! Error Kinds
//!
//! One `AppError` shared by the Engine (advisory), the Coordinator
//! (authoritative), and the HTTP control plane. Bid outcomes never
//! cross the protocol boundary as an exception — see
//! `crate::models::BidResult` — but every other fallible operation in
//! this crate returns `Result<T, AppError>`.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AppError {
    #[error("unknown auction or user: {0}")]
    NotFound(String),

    #[error("only the seller may perform this action")]
    PermissionDenied,

    #[error("illegal transition: {0}")]
    IllegalTransition(&'static str),

    #[error("bid too low")]
    BidTooLow,

    #[error("outpaced by another bidder")]
    OutpacedByAnother,

    #[error("duplicate bid still in flight")]
    DuplicateInFlight,

    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),

    #[error("failed to persist: {0}")]
    PersistFailed(String),

    #[error("arbiter or log unavailable: {0}")]
    Unavailable(String),
}

impl AppError {
    /// Stable, machine-parseable code for the protocol boundary
    /// (`BidResult.reason`, HTTP error bodies).
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::PermissionDenied => "permission_denied",
            AppError::IllegalTransition(_) => "illegal_transition",
            AppError::BidTooLow => "bid_too_low",
            AppError::OutpacedByAnother => "outpaced_by_another",
            AppError::DuplicateInFlight => "duplicate_in_flight",
            AppError::InvariantViolation(_) => "invariant_violation",
            AppError::PersistFailed(_) => "persist_failed",
            AppError::Unavailable(_) => "unavailable",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PermissionDenied => StatusCode::FORBIDDEN,
            AppError::IllegalTransition(_)
            | AppError::BidTooLow
            | AppError::OutpacedByAnother
            | AppError::DuplicateInFlight => StatusCode::BAD_REQUEST,
            AppError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::PersistFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn unknown_auction(auction_id: Uuid) -> Self {
        AppError::NotFound(format!("auction {auction_id}"))
    }

    pub fn unknown_user(user_id: Uuid) -> Self {
        AppError::NotFound(format!("user {user_id}"))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
