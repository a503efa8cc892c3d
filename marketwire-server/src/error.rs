//! Error taxonomy shared by the socket and HTTP surfaces.
//!
//! Every failure a client can observe maps onto one [`ChatError`] variant.
//! Auth failures are fatal to a live connection; everything else is
//! reported back to the sender and the connection stays open.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Why a bearer token was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    Missing,
    #[error("malformed token")]
    Malformed,
    #[error("bad token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("user directory unavailable: {0}")]
    Unavailable(String),
}

/// A stored enum column held a value this build does not know.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("cannot route message: {0}")]
    Routing(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    /// Text safe to show the client. Persistence details stay in the server log.
    pub fn client_message(&self) -> String {
        match self {
            Self::Persistence(_) => "message store temporarily unavailable, please retry".to_string(),
            Self::Auth(AuthError::Unavailable(_)) => "authentication temporarily unavailable".to_string(),
            other => other.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Routing(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        if let Self::Persistence(ref e) = self {
            tracing::error!(error = %e, "request failed in message store");
        }
        let body = serde_json::json!({ "error": self.client_message() });
        (self.status(), Json(body)).into_response()
    }
}
