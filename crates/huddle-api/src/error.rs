use std::fmt::Display;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use huddle_types::{ErrorKind, HuddleError};

/// HTTP face of `HuddleError`.
#[derive(Debug)]
pub struct ApiError(pub HuddleError);

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Failure outside the store (hashing, token signing). Logged here, and
    /// the caller only sees the generic internal error.
    pub fn internal(context: &str, err: impl Display) -> Self {
        error!("{} failed: {}", context, err);
        Self(HuddleError::Storage)
    }
}

impl From<HuddleError> for ApiError {
    fn from(err: HuddleError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Delivery => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let mut body = json!({
            "error": kind,
            "message": self.0.to_string(),
        });
        if let HuddleError::Validation(fields) = &self.0 {
            body["fields"] = json!(fields);
        }
        (status_for(kind), Json(body)).into_response()
    }
}
