use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, error};

use recall_engine::EngineError;

/// Failure of an HTTP request, mapped onto a status code and a JSON body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    /// Model provider failure. The detail is logged, never returned.
    #[error("AI service error, please try again later")]
    BadGateway(String),

    #[error("AI service error, please try again later")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadGateway(_) => "AI_SERVICE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(e) => Self::BadRequest(e.to_string()),
            EngineError::ConversationNotFound(id) => Self::NotFound(format!("conversation not found: {id}")),
            EngineError::ModelCall(e) => Self::BadGateway(format!("{} ({})", e, e.error_kind())),
            other @ (EngineError::Cancelled | EngineError::Internal(_)) => Self::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        match &self {
            Self::BadGateway(detail) | Self::Internal(detail) => {
                error!(error_code = code, detail = %detail, "request failed");
            }
            other => debug!(error_code = code, message = %other, "client error"),
        }

        let body = ErrorBody {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}
