//! Maps domain/store/coordinator errors onto the wire error body and the
//! status-code table from the external-interface error taxonomy: 400
//! validation, 401 auth, 404 not found, 409 conflict, 422 domain rule, 5xx
//! internal.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pc_coordinator::CoordinatorError;
use pc_store::StoreError;
use pc_wire::ErrorBody;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    Validation(String),
    #[error("not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Domain(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn auth(msg: impl Into<String>) -> Self {
        ApiError::Auth(msg.into())
    }

    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Auth(_) => (StatusCode::UNAUTHORIZED, "AUTH"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Domain(_) => (StatusCode::UNPROCESSABLE_ENTITY, "DOMAIN"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        let error_message = self.to_string();
        (
            status,
            Json(ErrorBody {
                error_type: error_type.to_string(),
                error_message,
                details: None,
            }),
        )
            .into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match &err {
            CoordinatorError::RunNotFound => ApiError::NotFound("run not found"),
            CoordinatorError::RunAlreadyTerminal => ApiError::Conflict(err.to_string()),
            CoordinatorError::InvalidStatusTransition { .. } => ApiError::Conflict(err.to_string()),
            CoordinatorError::DocumentAlreadyAttached => ApiError::Conflict(err.to_string()),
            CoordinatorError::DocumentNotAttached => ApiError::NotFound("document not attached to run"),
            CoordinatorError::TenantMismatch => ApiError::Auth(err.to_string()),
            CoordinatorError::Validation(msg) => ApiError::Validation(msg.clone()),
            CoordinatorError::Store(_) | CoordinatorError::Vault(_) | CoordinatorError::Storage(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("not found"),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
