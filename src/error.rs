use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::inference::slot::InferenceError;

// Taken from https://github.com/tokio-rs/axum/blob/main/examples/anyhow-error-response/src/main.rs
#[derive(Debug)]
pub struct RunnerError {
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

impl RunnerError {
    pub fn new(status: StatusCode, message: impl Into<HttpErrorResponse>) -> Self {
        RunnerError {
            status,
            message: message.into(),
        }
    }

    /// Maps a failed slot call onto the status the caller sees.
    pub fn from_inference(err: InferenceError) -> Self {
        let status = match err {
            InferenceError::Arity { .. } => StatusCode::BAD_REQUEST,
            InferenceError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
            InferenceError::Poisoned | InferenceError::Run(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        RunnerError::new(status, err.to_string())
    }
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request failed with {}: {}", self.status, self.message.message());
        }
        let mut res = Json(self.message).into_response();
        *res.status_mut() = self.status;
        res
    }
}

impl<E> From<E> for RunnerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        RunnerError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: HttpErrorResponse::from(err.into().to_string()),
        }
    }
}

pub type RunnerResult<T, E = RunnerError> = Result<T, E>;

#[macro_export]
macro_rules! bail_runner {
    ($error_message:expr) => {
        return Err($crate::error::RunnerError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            $error_message,
        ))
    };
    ($status_code:expr, $error_message:expr) => {
        return Err($crate::error::RunnerError::new($status_code, $error_message))
    };
    ($status:expr, $fmt:expr $(, $arg:expr)*) => {
        return Err($crate::error::RunnerError::new(
            $status,
            format!($fmt $(, $arg)*),
        ))
    };
}
