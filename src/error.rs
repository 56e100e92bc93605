//! Service Error Taxonomy
//!
//! Every operation of the catalog service resolves to either a success payload or one of
//! the variants below. Handlers never build status codes by hand; they return `Error` and
//! let [`IntoResponse`] pick the status.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::catalog::search::InvalidSearchValue;
use crate::catalog::types::Category;
use crate::store::version::VersionToken;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shared key missing or different from the configured one.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    /// Malformed payload, invalid device id, unparsable value, rejected rebalance.
    #[error("{0}")]
    BadRequest(String),

    #[error("{category} builder hash differs (expected {expected}, current {current})")]
    StaleVersion {
        category: Category,
        expected: VersionToken,
        current: VersionToken,
    },

    #[error("{resource} locked.")]
    LockTimeout { resource: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::StaleVersion { .. } | Error::LockTimeout { .. } => StatusCode::CONFLICT,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable name of the variant, sent alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthorized => "unauthorized",
            Error::NotFound(_) => "not_found",
            Error::BadRequest(_) => "bad_request",
            Error::StaleVersion { .. } => "stale_version",
            Error::LockTimeout { .. } => "locked",
            Error::Internal(_) => "internal",
        }
    }

    /// Conflicts are the only errors a caller can fix by re-reading and resubmitting.
    pub fn is_conflict(&self) -> bool {
        self.status_code() == StatusCode::CONFLICT
    }
}

impl From<InvalidSearchValue> for Error {
    fn from(e: InvalidSearchValue) -> Self {
        Error::BadRequest(e.to_string())
    }
}

/// Body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub code: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let Error::Internal(e) = &self {
            tracing::error!("Internal error: {:?}", e);
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
