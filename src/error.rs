use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors from the portal scrape path: login, the API walk, and parsing.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {context}")]
    UnexpectedStatus { context: &'static str, status: u16 },

    #[error("login form not found (status={status}, url={url}, body starts: {snippet})")]
    LoginFormMissing {
        status: u16,
        url: String,
        snippet: String,
    },

    #[error("login form action missing")]
    FormActionMissing,

    #[error("login form action is not a usable URL: {0}")]
    FormActionInvalid(String),

    #[error("login failed (status={status})")]
    LoginRejected { status: u16 },

    #[error("no access_token in login redirect")]
    TokenMissing,

    #[error("{field} not found in {context} response")]
    MissingField {
        context: &'static str,
        field: &'static str,
    },

    #[error("study profile not found in academic-review response")]
    ProfileNotFound,

    #[error("study profile has no periods")]
    NoPeriods,
}

#[derive(Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub struct ApiError {
    pub status: StatusCode,
    pub body: ApiErrorBody,
}

impl ApiError {
    pub fn with_code(
        status: StatusCode,
        error: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            status,
            body: ApiErrorBody {
                error: error.into(),
                code: Some(code.into()),
            },
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_code(StatusCode::INTERNAL_SERVER_ERROR, message, "INTERNAL_ERROR")
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::with_code(
            StatusCode::SERVICE_UNAVAILABLE,
            message,
            "SERVICE_UNAVAILABLE",
        )
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::with_code(StatusCode::TOO_MANY_REQUESTS, message, "TOO_MANY_REQUESTS")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
