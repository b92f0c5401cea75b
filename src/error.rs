use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

use crate::completion::CompletionError;
use crate::transcription::TranscriptionError;

// Taken from https://github.com/tokio-rs/axum/blob/main/examples/anyhow-error-response/src/main.rs
#[derive(Debug)]
pub struct ServiceError {
    pub status: StatusCode,
    pub message: HttpErrorResponse,
}

#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    error: String,
}

impl HttpErrorResponse {
    pub fn message(&self) -> &str {
        &self.error
    }
}

impl From<String> for HttpErrorResponse {
    fn from(message: String) -> Self {
        HttpErrorResponse { error: message }
    }
}

impl From<&str> for HttpErrorResponse {
    fn from(message: &str) -> Self {
        HttpErrorResponse {
            error: message.to_string(),
        }
    }
}

impl ServiceError {
    pub fn new(status: StatusCode, message: impl Into<HttpErrorResponse>) -> Self {
        ServiceError {
            status,
            message: message.into(),
        }
    }

    pub fn model_not_ready() -> Self {
        ServiceError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Whisper model not loaded. Please wait for startup.",
        )
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = self.message.message(), "request failed");
        } else {
            warn!(status = %self.status, error = self.message.message(), "request rejected");
        }
        let mut res = Json(self.message).into_response();
        *res.status_mut() = self.status;
        res
    }
}

impl From<TranscriptionError> for ServiceError {
    fn from(err: TranscriptionError) -> Self {
        let status = match err {
            TranscriptionError::InvalidContentType => StatusCode::BAD_REQUEST,
            TranscriptionError::Io(_)
            | TranscriptionError::Model(_)
            | TranscriptionError::EmptyTranscript => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ServiceError::new(status, err.to_string())
    }
}

impl From<CompletionError> for ServiceError {
    fn from(err: CompletionError) -> Self {
        let status = match &err {
            CompletionError::Upstream { status, .. } => *status,
            CompletionError::MissingApiKey
            | CompletionError::Transport(_)
            | CompletionError::InvalidResponse(_)
            | CompletionError::EmptyResponse => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ServiceError::new(status, err.to_string())
    }
}

impl From<MultipartError> for ServiceError {
    fn from(err: MultipartError) -> Self {
        ServiceError::new(err.status(), err.body_text())
    }
}

impl From<MultipartRejection> for ServiceError {
    fn from(err: MultipartRejection) -> Self {
        ServiceError::new(err.status(), err.body_text())
    }
}

pub type ServiceResult<T, E = ServiceError> = Result<T, E>;

#[macro_export]
macro_rules! bail_service {
    ($error_message:expr) => {
        return Err($crate::error::ServiceError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            $error_message,
        ))
    };
    ($status_code:expr, $error_message:expr) => {
        return Err($crate::error::ServiceError::new($status_code, $error_message))
    };
    ($status:expr, $fmt:expr $(, $arg:expr)*) => {
        return Err($crate::error::ServiceError::new($status, format!($fmt $(, $arg)*)))
    };
}
