//! Error types for fedibox
//!
//! All errors in the application are converted to `AppError`, which
//! implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type.
///
/// `UpstreamFetchFailure` and `DeliveryFailure` are not variants here: per
/// the outbox pipeline's contract neither is ever surfaced to the HTTP
/// client, so they never need an `IntoResponse` mapping. They are logged at
/// the point they occur and the affected recipient is skipped.
#[derive(Debug, Error)]
pub enum AppError {
    /// The request body's media type is not an ActivityPub-compatible one.
    /// Returned as 404 rather than 415 — a deliberate compatibility quirk
    /// some federated servers rely on.
    #[error("Resource not found")]
    UnsupportedMediaType,

    /// The submitted activity failed structural or semantic validation.
    #[error("Invalid activity: {0}")]
    InvalidActivity(String),

    /// The named actor does not exist on this instance.
    #[error("'{0}' not found on this instance")]
    UnknownActor(String),

    /// The authenticated actor does not own the activity or target object.
    #[error("You do not have permission to perform this action")]
    OwnershipViolation,

    /// A verb handler required a target the activity did not provide.
    #[error("Missing target: {0}")]
    MissingTarget(String),

    /// Activity store failure (SQLite).
    #[error("Store error: {0}")]
    StoreFailure(#[from] sqlx::Error),

    /// Outbound HTTP failure talking to another server.
    #[error("Federation error: {0}")]
    Federation(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Federation(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::UnsupportedMediaType => {
                (StatusCode::NOT_FOUND, self.to_string(), "not_found")
            }
            AppError::InvalidActivity(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "invalid_activity")
            }
            AppError::UnknownActor(_) => {
                (StatusCode::NOT_FOUND, self.to_string(), "unknown_actor")
            }
            AppError::OwnershipViolation => (
                StatusCode::FORBIDDEN,
                self.to_string(),
                "ownership_violation",
            ),
            AppError::MissingTarget(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "missing_target")
            }
            AppError::StoreFailure(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Store error".to_string(),
                "store_failure",
            ),
            AppError::Federation(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "federation"),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL
            .with_label_values(&[error_type, "unknown"])
            .inc();

        let body = Json(serde_json::json!({ "error": error_message }));
        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
