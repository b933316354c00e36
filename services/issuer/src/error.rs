//! Admin API error mapping
//!
//! Every failure leaves the API as `{"error": "..."}` with a status code
//! chosen by the error kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Issuance(#[from] issuance::Error),

    #[error(transparent)]
    Proxy(#[from] proxy_pool::Error),

    #[error(transparent)]
    Store(#[from] account_store::Error),

    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Issuance(e) => match e {
                issuance::Error::NoFreeCredentials => StatusCode::SERVICE_UNAVAILABLE,
                issuance::Error::AlreadyProcessed(_) | issuance::Error::InvalidTransition { .. } => {
                    StatusCode::CONFLICT
                }
                issuance::Error::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                issuance::Error::NotFound(_) => StatusCode::NOT_FOUND,
                issuance::Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Proxy(e) => match e {
                proxy_pool::Error::Parse(_) => StatusCode::BAD_REQUEST,
                proxy_pool::Error::NotFound(_) => StatusCode::NOT_FOUND,
                proxy_pool::Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self, "admin request failed");
        }
        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": self.to_string() }).to_string(),
        )
            .into_response()
    }
}
