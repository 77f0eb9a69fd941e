//! Typed error kinds shared by the gateways and the HTTP front-end.
//!
//! Every gateway surfaces expected domain failures as a [`KumoError`]
//! carrying a [`ErrorKind`] classification, a platform-facing error name
//! (the `name` field of the JSON error body), and a human-readable message.
//! Backend I/O errors propagate unchanged inside the `Io` kind. The
//! front-end translates uncaught errors into an HTTP status derived from
//! the kind plus a JSON body `{name, message, stack?}`; when a stack is
//! attached the response carries the `MF-Experimental-Error-Stack: true`
//! header so test harnesses can detect it.
//!
//! # Examples
//!
//! ```rust
//! use kumo::error::{ErrorKind, KumoError};
//!
//! let err = KumoError::new(ErrorKind::Validation, "TypeError", "key too long");
//! assert_eq!(err.status().as_u16(), 400);
//! ```

use http::{HeaderValue, StatusCode};
use serde::Serialize;

use crate::{body::KumoBody, responder::Responder, types::Response};

/// Convenience result alias used across the crate.
pub type Result<T, E = KumoError> = std::result::Result<T, E>;

/// Classification of a simulator error.
///
/// The kind determines the HTTP status the front-end uses when an error
/// escapes the worker, and lets dispatchers distinguish retryable consumer
/// failures from programming errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad key, size, metadata, range or limit.
    Validation,
    /// A conditional operation failed; prior metadata may be attached.
    Precondition,
    /// Transaction retry exhausted. Unused on normal paths: commit retries
    /// are unbounded by design.
    Conflict,
    /// Absent key surfaced as an error rather than `None`.
    NotFound,
    /// A provided digest did not match the computed one.
    Integrity,
    /// A size or count limit was exceeded.
    Capacity,
    /// Invalid simulator configuration.
    Configuration,
    /// Unrecoverable backend I/O failure.
    Io,
    /// API misuse, such as operating on a rolled-back transaction or
    /// accepting a coupled WebSocket.
    Programming,
}

impl ErrorKind {
    /// HTTP status used when an error of this kind escapes to the front-end.
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation | ErrorKind::Integrity => StatusCode::BAD_REQUEST,
            ErrorKind::Precondition => StatusCode::PRECONDITION_FAILED,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Capacity => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::Configuration | ErrorKind::Io | ErrorKind::Programming => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// A typed simulator error.
///
/// `name` is the platform-facing error identifier (for example `TypeError`
/// or `ERR_TRAVERSAL`); `message` is the human-readable description.
#[derive(Debug, thiserror::Error)]
#[error("{name}: {message}")]
pub struct KumoError {
    kind: ErrorKind,
    name: String,
    message: String,
    stack: Option<String>,
}

impl KumoError {
    /// Creates a new error with the given kind, name, and message.
    pub fn new(kind: ErrorKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Shorthand for a `Validation` error named `TypeError`, the kind the
    /// platform raises for API misuse visible to user code.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, "TypeError", message)
    }

    /// Shorthand for a `Programming` error.
    pub fn programming(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Programming, "Error", message)
    }

    /// Wraps a backend I/O failure, keeping the original message.
    pub fn io(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Io, "Error", err.to_string())
    }

    /// Attaches a pseudo-stack rendered into the JSON error body.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// The error classification.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The platform-facing error name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    /// Renders the error into the front-end's JSON response, including the
    /// `MF-Experimental-Error-Stack` header when a stack is present.
    pub fn into_http_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody<'a> {
            name: &'a str,
            message: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            stack: Option<&'a str>,
        }

        let body = ErrorBody {
            name: &self.name,
            message: &self.message,
            stack: self.stack.as_deref(),
        };
        let json = serde_json::to_string(&body)
            .unwrap_or_else(|_| format!("{{\"name\":\"{}\"}}", self.name));

        let mut res = hyper::Response::new(KumoBody::from(json));
        *res.status_mut() = self.status();
        res.headers_mut()
            .insert("content-type", HeaderValue::from_static("application/json"));
        if self.stack.is_some() {
            res.headers_mut().insert(
                "mf-experimental-error-stack",
                HeaderValue::from_static("true"),
            );
        }
        res
    }
}

impl Responder for KumoError {
    fn into_response(self) -> Response {
        self.into_http_response()
    }
}

impl From<std::io::Error> for KumoError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err)
    }
}

impl From<rusqlite::Error> for KumoError {
    fn from(err: rusqlite::Error) -> Self {
        Self::io(err)
    }
}

impl From<serde_json::Error> for KumoError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Validation, "SyntaxError", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_kind() {
        assert_eq!(
            KumoError::new(ErrorKind::Capacity, "EntityTooLarge", "too big").status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(KumoError::type_error("nope").status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn stack_header_only_when_attached() {
        let plain = KumoError::type_error("x").into_http_response();
        assert!(!plain.headers().contains_key("mf-experimental-error-stack"));

        let stacked = KumoError::type_error("x")
            .with_stack("TypeError: x\n    at worker")
            .into_http_response();
        assert_eq!(
            stacked
                .headers()
                .get("mf-experimental-error-stack")
                .and_then(|v| v.to_str().ok()),
            Some("true")
        );
    }
}
