use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::trip::TripStatus;

/// Outcomes of dispatch and lifecycle operations.
///
/// Everything except [`TripError::StoreUnavailable`] is ordinary control flow:
/// callers branch on it instead of raising an alarm.
#[derive(Debug, Error)]
pub enum TripError {
    #[error("trip was claimed by another driver")]
    ClaimConflict,
    #[error("trip is not claimable")]
    NotClaimable,
    #[error("driver already has an active trip")]
    DriverBusy,
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: TripStatus, to: TripStatus },
    #[error("transition already applied")]
    AlreadyApplied,
    #[error("trip not found")]
    TripNotFound,
    #[error("not a party to this trip")]
    NotAParty,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("trip store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
}

impl TripError {
    pub fn is_outcome(&self) -> bool {
        !matches!(self, TripError::StoreUnavailable(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            TripError::ClaimConflict
            | TripError::NotClaimable
            | TripError::DriverBusy
            | TripError::IllegalTransition { .. } => StatusCode::CONFLICT,
            TripError::AlreadyApplied => StatusCode::OK,
            TripError::TripNotFound => StatusCode::NOT_FOUND,
            TripError::NotAParty => StatusCode::FORBIDDEN,
            TripError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TripError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            TripError::ClaimConflict => "claim_conflict",
            TripError::NotClaimable => "not_claimable",
            TripError::DriverBusy => "driver_busy",
            TripError::IllegalTransition { .. } => "illegal_transition",
            TripError::AlreadyApplied => "already_applied",
            TripError::TripNotFound => "trip_not_found",
            TripError::NotAParty => "not_a_party",
            TripError::InvalidInput(_) => "invalid_input",
            TripError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Trip(#[from] TripError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Trip(err) => err.status_code(),
            AppError::Config(_)
            | AppError::Io(_)
            | AppError::Database(_)
            | AppError::Migrate(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Trip(err) => err.code(),
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            _ => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "error": self.code(), "message": self.to_string() }));
        (status, body).into_response()
    }
}
