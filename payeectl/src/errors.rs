//! Error types and HTTP response conversion.
//!
//! Handlers return `Result<T, Error>`; every error converts to a JSON
//! response with the appropriate status code. Engine errors map through
//! their variants (not-found, duplicate, invalid state) instead of
//! collapsing to 500.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use dossier::DossierError;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// Request authentication failed (webhook signature, missing secret)
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Engine operation error
    #[error(transparent)]
    Engine(#[from] DossierError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Error::Engine(engine) => match engine {
                DossierError::BatchNotFound(_)
                | DossierError::RecordNotFound(_)
                | DossierError::SearchNotFound(_)
                | DossierError::KeywordNotFound(_) => StatusCode::NOT_FOUND,
                DossierError::Duplicate(_) => StatusCode::CONFLICT,
                DossierError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                DossierError::InvalidState { .. } => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// User-safe message, without internal detail for 500s.
    fn user_message(&self) -> String {
        match self {
            Error::Other(_) => "Internal server error".to_string(),
            Error::Engine(engine) if self.status_code() == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::debug!(error = %engine, "Masked engine error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match status {
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!("Internal service error: {:#}", self);
            }
            StatusCode::UNAUTHORIZED => {
                tracing::info!("Authorization error: {}", self);
            }
            _ => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let body = serde_json::json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "message": self.user_message(),
        });
        (status, axum::response::Json(body)).into_response()
    }
}

/// Type alias for handler results.
pub type Result<T> = std::result::Result<T, Error>;
