//! Error types and HTTP response conversion.
//!
//! The [`Error`] enum covers every failure the controller reports to clients:
//!
//! - `InvalidUsage` (400): malformed payloads, unknown values, bad arguments
//! - `InvalidPath` (404): request for an endpoint that does not exist
//! - `InvalidMethod` (405): request method the endpoint does not accept
//! - `PreconditionFailed` (409): a `require_state` condition is not met
//! - `Config` (500): an error in the configuration, fatal at load time
//! - `Internal` (500): anything else
//!
//! Errors serialise as `{"status_code": u16, "message": str, "context"?: any}`
//! and implement [`IntoResponse`] so handlers can return `Result<T, Error>`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Improper client usage: bad JSON, unknown value, bad argument.
    #[error("{message}")]
    InvalidUsage { message: String, context: Option<Value> },

    /// The endpoint does not accept this request method.
    #[error("{message}")]
    InvalidMethod { message: String },

    /// No endpoint with the requested name.
    #[error("{message}")]
    InvalidPath { message: String },

    /// A state precondition for the call is not met.
    #[error("{message}")]
    PreconditionFailed { message: String },

    /// An error in the configuration. Fatal when raised at load time.
    #[error("{message}")]
    Config { message: String },

    /// Internal controller error.
    #[error("{message}")]
    Internal { message: String },
}

impl Error {
    pub fn invalid_usage(message: impl Into<String>) -> Self {
        Error::InvalidUsage {
            message: message.into(),
            context: None,
        }
    }

    pub fn invalid_usage_with(message: impl Into<String>, context: Value) -> Self {
        Error::InvalidUsage {
            message: message.into(),
            context: Some(context),
        }
    }

    pub fn invalid_method(message: impl Into<String>) -> Self {
        Error::InvalidMethod { message: message.into() }
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Error::InvalidPath { message: message.into() }
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Error::PreconditionFailed { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal { message: message.into() }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidUsage { .. } => StatusCode::BAD_REQUEST,
            Error::InvalidMethod { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Error::InvalidPath { .. } => StatusCode::NOT_FOUND,
            Error::PreconditionFailed { .. } => StatusCode::CONFLICT,
            Error::Config { .. } | Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The JSON body clients receive for this error.
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "status_code": self.status_code().as_u16(),
            "message": self.to_string(),
        });
        if let Error::InvalidUsage {
            context: Some(context), ..
        } = self
        {
            body["context"] = context.clone();
        }
        body
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_body())).into_response()
    }
}
