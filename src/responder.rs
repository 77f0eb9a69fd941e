//! Response generation utilities and trait implementations.
//!
//! This module provides the `Responder` trait that enables various types to
//! be converted into HTTP responses. The front-end and the cache gateway use
//! it to turn strings, status tuples, and typed errors into proper responses
//! without repeating builder boilerplate.
//!
//! # Examples
//!
//! ```rust
//! use kumo::responder::Responder;
//! use http::StatusCode;
//!
//! let response = "Hello, World!".into_response();
//! let response = (StatusCode::NOT_FOUND, "<miss>").into_response();
//! ```

use std::{convert::Infallible, fmt::Display};

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;

use crate::body::KumoBody;

/// Trait for converting types into HTTP responses.
///
/// # Examples
///
/// ```rust
/// use kumo::responder::Responder;
/// use kumo::body::KumoBody;
/// use http::Response;
///
/// struct JsonResponse {
///     data: String,
/// }
///
/// impl Responder for JsonResponse {
///     fn into_response(self) -> Response<KumoBody> {
///         let mut response = Response::new(KumoBody::from(self.data));
///         response.headers_mut().insert(
///             "content-type",
///             "application/json".parse().unwrap()
///         );
///         response
///     }
/// }
/// ```
pub trait Responder {
    /// Converts the implementing type into an HTTP response.
    fn into_response(self) -> Response<KumoBody>;
}

impl Responder for Response<KumoBody> {
    fn into_response(self) -> Response<KumoBody> {
        self
    }
}

impl Responder for &'static str {
    fn into_response(self) -> Response<KumoBody> {
        Response::new(KumoBody::new(Full::from(Bytes::from_static(
            self.as_bytes(),
        ))))
    }
}

impl Responder for String {
    fn into_response(self) -> Response<KumoBody> {
        Response::new(KumoBody::new(Full::from(Bytes::from(self))))
    }
}

impl Responder for () {
    fn into_response(self) -> Response<KumoBody> {
        Response::new(KumoBody::empty())
    }
}

impl Responder for Infallible {
    fn into_response(self) -> Response<KumoBody> {
        match self {}
    }
}

/// Converts a status code and displayable body into an HTTP response.
impl<R> Responder for (StatusCode, R)
where
    R: Display,
{
    fn into_response(self) -> Response<KumoBody> {
        let (status, body) = self;
        let mut res = Response::new(KumoBody::new(Full::from(Bytes::from(body.to_string()))));
        *res.status_mut() = status;
        res
    }
}

impl Responder for KumoBody {
    fn into_response(self) -> Response<KumoBody> {
        Response::new(self)
    }
}

impl Responder for anyhow::Error {
    fn into_response(self) -> Response<KumoBody> {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}
