//! HTTP error envelope.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::admission::{Rejection, RejectionKind};
use crate::scheduler::PoolError;
use crate::service::ServiceError;
use crate::upload::UploadError;

/// Everything a handler can fail with, rendered as
/// `{"success": false, "error": ...}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    Rejected(Rejection),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        Self::Rejected(rejection)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Rejected(rejection) => match rejection.kind {
                RejectionKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                RejectionKind::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Upload(UploadError::InvalidExtension(_) | UploadError::Empty) => {
                StatusCode::BAD_REQUEST
            }
            Self::Upload(UploadError::Io { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Service(ServiceError::Parameter(_)) => StatusCode::BAD_REQUEST,
            Self::Service(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Service(ServiceError::Pool(PoolError::ShuttingDown)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Service(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Upload(UploadError::Io { .. }) => "failed to save uploaded file".to_string(),
            Self::Service(ServiceError::Execution(result)) => format!("tool error: {}", result.stderr),
            Self::Service(ServiceError::Runner(e)) => format!("tool execution failed: {e}"),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && !matches!(self, Self::Rejected(_)) {
            tracing::error!(status = status.as_u16(), "request failed: {self}");
        }

        let mut body = json!({
            "success": false,
            "error": self.message(),
        });
        if let Self::Service(e) = &self {
            if let Some(stdout) = e.stdout().filter(|s| !s.is_empty()) {
                body["stdout"] = json!(stdout);
            }
        }
        let retry_after = match &self {
            Self::Rejected(rejection) => Some(rejection.retry_after.as_secs().max(1)),
            _ => None,
        };
        if let Some(secs) = retry_after {
            body["retry_after"] = json!(secs);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
