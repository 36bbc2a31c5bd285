// ABOUTME: API error type mapping to {error, message?} bodies with machine codes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    BadRequest {
        code: &'static str,
        message: Option<String>,
    },
    NotFound {
        code: &'static str,
    },
    Conflict {
        code: &'static str,
    },
    Internal(String),
}

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            code,
            message: Some(message.into()),
        }
    }

    pub fn not_found(code: &'static str) -> Self {
        ApiError::NotFound { code }
    }

    pub fn conflict(code: &'static str) -> Self {
        ApiError::Conflict { code }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            ApiError::NotFound { code } => (StatusCode::NOT_FOUND, code, None),
            ApiError::Conflict { code } => (StatusCode::CONFLICT, code, None),
            ApiError::Internal(message) => {
                error!(error = %message, "internal api error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    // Internal details stay in the log, not the response.
                    None,
                )
            }
        };
        let body = ErrorBody {
            error: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
