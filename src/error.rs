use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::constants::{PG_DEADLOCK_DETECTED, PG_SERIALIZATION_FAILURE, PG_UNIQUE_VIOLATION};
use crate::models::ObserverState;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("External API error: {0}")]
    ExternalAPI(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// SQLSTATE reported by Postgres, if this is a database-side error.
    pub fn db_code(&self) -> Option<String> {
        match self {
            AppError::Database(sqlx::Error::Database(db_err)) => {
                db_err.code().map(|code| code.into_owned())
            }
            _ => None,
        }
    }

    /// Deadlock or serialization failure: the whole transaction may be re-run.
    pub fn is_retryable(&self) -> bool {
        self.db_code()
            .map(|code| is_retryable_code(&code))
            .unwrap_or(false)
    }

    pub fn is_unique_violation(&self) -> bool {
        self.db_code().as_deref() == Some(PG_UNIQUE_VIOLATION)
    }

    /// Unique violation raised by the named constraint.
    pub fn violates(&self, constraint: &str) -> bool {
        match self {
            AppError::Database(sqlx::Error::Database(db_err)) => violates_constraint(
                db_err.code().as_deref(),
                db_err.constraint(),
                constraint,
            ),
            _ => false,
        }
    }
}

pub fn violates_constraint(code: Option<&str>, actual: Option<&str>, expected: &str) -> bool {
    code == Some(PG_UNIQUE_VIOLATION) && actual == Some(expected)
}

pub fn is_retryable_code(code: &str) -> bool {
    code == PG_DEADLOCK_DETECTED || code == PG_SERIALIZATION_FAILURE
}

/// Rejected state-machine transitions. None of these are fatal: the session is
/// left untouched and the caller decides whether to log or report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no snapshot received yet")]
    NotJoined,

    #[error("{event} is not valid while the round is {state}")]
    InvalidRoundState { event: &'static str, state: String },

    #[error("no wager recorded for {0}")]
    UnknownWager(String),

    #[error("{identity} already cashed out at {stopped_at}")]
    AlreadyCashedOut { identity: String, stopped_at: i64 },

    #[error("cannot {action} while {state:?}")]
    InvalidObserverAction {
        action: &'static str,
        state: ObserverState,
    },

    #[error("bet amount must be positive")]
    InvalidAmount,

    #[error("session driver is not running")]
    DriverStopped,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Database(ref e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                e.to_string(),
            ),
            AppError::NotFound(ref msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(ref msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone())
            }
            AppError::Session(ref e) => (StatusCode::CONFLICT, "SESSION_CONFLICT", e.to_string()),
            AppError::MalformedPayload(ref msg) => {
                (StatusCode::BAD_REQUEST, "MALFORMED_PAYLOAD", msg.clone())
            }
            AppError::ExternalAPI(ref msg) => {
                (StatusCode::BAD_GATEWAY, "EXTERNAL_API_ERROR", msg.clone())
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
