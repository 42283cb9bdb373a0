use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Error taxonomy for the sync core.
///
/// Protocol errors are reported back to the originating connection only and
/// never close it; resolution errors mean a referenced group/device does not
/// exist; persistence errors abort the whole operation they occurred in.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("malformed message: {0}")]
    Protocol(String),
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("activation code mismatch")]
    ActivationCodeMismatch,
    #[error("{0}")]
    NotFound(String),
    #[error("group is disabled")]
    GroupDisabled,
    #[error("missing activation code")]
    MissingActivationCode,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the error should be surfaced to the peer as a protocol-level
    /// error frame rather than logged as a server fault.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            AppError::Protocol(_)
                | AppError::UnknownMessageType(_)
                | AppError::ActivationCodeMismatch
                | AppError::NotFound(_)
                | AppError::GroupDisabled
                | AppError::MissingActivationCode
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Protocol(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::UnknownMessageType(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::ActivationCodeMismatch => {
                (StatusCode::UNAUTHORIZED, "activation code mismatch".to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::GroupDisabled => (StatusCode::FORBIDDEN, "group is disabled".to_string()),
            AppError::MissingActivationCode => {
                (StatusCode::BAD_REQUEST, "missing activation code".to_string())
            }
            AppError::Database(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("database error: {err}"),
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": error_message }))).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Protocol(format!("invalid JSON payload: {err}"))
    }
}
