use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::agent::AgentError;
use crate::store::StoreError;
use crate::twilio::TwilioError;

pub const INTERNAL_ERROR_BODY: &str = "Internal Server Error";

/// Errors as the HTTP boundary sees them. Only dependency failures hide their
/// detail from the caller.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Dependency(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Authentication(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Dependency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        if error.is_not_found() {
            ApiError::NotFound(error.to_string())
        } else {
            ApiError::Dependency(error.into())
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(error: AgentError) -> Self {
        match error {
            AgentError::Store(store) => store.into(),
            other => ApiError::Dependency(other.into()),
        }
    }
}

impl From<TwilioError> for ApiError {
    fn from(error: TwilioError) -> Self {
        ApiError::Dependency(error.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::Dependency(error) => {
                tracing::error!("Request failed: {:#}", error);
                (status, INTERNAL_ERROR_BODY.to_string()).into_response()
            }
            other => (status, other.to_string()).into_response(),
        }
    }
}
