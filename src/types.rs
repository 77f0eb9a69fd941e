//! Core type definitions and aliases used throughout the kumo simulator.
//!
//! This module provides the fundamental type aliases shared by the HTTP
//! front-end, the gateways, and the pluggable worker instance. `Request` is
//! the hyper-side request as accepted by the front-end, while `WorkerRequest`
//! is what the worker sees after the front-end has stripped control headers
//! and re-wrapped the body. Keeping the aliases here hides the generic
//! parameters from the rest of the crate.
//!
//! # Examples
//!
//! ```rust
//! use kumo::types::{WorkerRequest, Response};
//! use kumo::body::KumoBody;
//!
//! async fn handler(req: WorkerRequest) -> Response {
//!     Response::new(KumoBody::from(format!("hello {}", req.uri().path())))
//! }
//! ```

use bytes::Bytes;
use http_body_util::combinators::BoxBody as HttpBoxBody;
use hyper::body::Incoming;

use crate::body::KumoBody;

/// HTTP request type as accepted by the front-end server.
///
/// The body is hyper's `Incoming` stream; the front-end converts it into a
/// [`WorkerRequest`] before dispatching into the worker.
pub type Request = hyper::Request<Incoming>;

/// HTTP request type as seen by the worker instance.
///
/// Control headers have been stripped and the body re-wrapped in
/// [`KumoBody`] so that tests and internal dispatchers (queues, alarms) can
/// construct requests without a live connection.
pub type WorkerRequest = hyper::Request<KumoBody>;

/// HTTP response type produced by the worker and the gateways.
pub type Response = hyper::Response<KumoBody>;

/// Boxed HTTP body type for internal response handling. The `Send` bound
/// lets queue dispatchers, alarm fires, and rewriter pipelines carry
/// bodies across task boundaries.
pub(crate) type BoxBody = HttpBoxBody<Bytes, BoxError>;

/// Boxed error type for thread-safe error handling.
pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
