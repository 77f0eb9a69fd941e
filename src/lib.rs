#![cfg_attr(docsrs, feature(doc_cfg))]

//! A local simulator for a serverless edge-worker platform.
//!
//! Kumo hosts a pluggable worker instance behind an HTTP server and
//! executes it against faithful local implementations of the platform's
//! storage, messaging and networking primitives, with state optionally
//! persisted to disk.
//!
//! # High-level features
//! - Uniform key/value + range-read storage substrate with in-memory and
//!   file-system backends, expiration, metadata, and embedded SQL handles
//! - Durable-object transactional store with optimistic concurrency,
//!   input/output gating, and alarms
//! - KV gateway with TTLs, prefix listing, and a read-through cache
//! - HTTP response cache with `Vary`-free fingerprints, conditional
//!   request semantics, and byte-range responses
//! - Object-store gateway with conditional puts, multipart uploads, and
//!   HTTP metadata
//! - Queue broker with batching, retries, and dead-letter routing
//! - In-process WebSocket pairs with a bridge to real network sockets
//! - Selector-driven streaming HTML rewriter
//!
//! # Compatibility
//! - Runtime: `tokio`
//! - HTTP: `hyper` 1.x
//!
//! # Quickstart
//!
//! ```rust,no_run
//! use kumo::{Kumo, serve, config::KumoOptions};
//! use kumo::worker::WorkerInstance;
//! use kumo::types::{WorkerRequest, Response};
//! use kumo::gate::RequestContext;
//! use kumo::body::KumoBody;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl WorkerInstance for Hello {
//!     async fn fetch(&self, _req: WorkerRequest, _ctx: RequestContext)
//!         -> kumo::error::Result<Response>
//!     {
//!         Ok(Response::new(KumoBody::from("Hello, World!")))
//!     }
//! }
//!
//! # async fn example() {
//! let listener = TcpListener::bind("127.0.0.1:8787").await.unwrap();
//! serve(listener, Kumo::new(Arc::new(Hello), KumoOptions::default())).await;
//! # }
//! ```
//!
//! # Key concepts
//! - [`storage::Storage`] is the substrate contract every gateway builds
//!   on.
//! - [`worker::WorkerInstance`] is the seam to the script loader and
//!   isolate, which are external collaborators.
//! - [`gate::RequestContext`] carries the input/output gates and the
//!   subrequest budget through a request.

/// HTTP request and response body handling utilities.
pub mod body;

/// HTTP response cache gateway.
pub mod cache;

/// Pluggable clock used by storage and gateways.
pub mod clock;

/// Simulator configuration options.
pub mod config;

/// Durable-object transactional store and alarms.
pub mod durable;

/// Typed error kinds and HTTP translation.
pub mod error;

/// Input/output gates and the per-request context.
pub mod gate;

/// Keyed value store gateway.
pub mod kv;

/// Queue broker: batching, retries, dead-letter routing.
pub mod queue;

/// Object-store gateway: blobs, metadata, multipart.
pub mod r2;

/// Response generation utilities and traits.
pub mod responder;

/// Selector-driven streaming HTML rewriter.
pub mod rewriter;

/// HTTP front-end server.
mod server;

/// Storage substrate: contract and backends.
pub mod storage;

/// Structured logging initialization.
#[cfg(feature = "kumo-tracing")]
#[cfg_attr(docsrs, doc(cfg(feature = "kumo-tracing")))]
pub mod tracing;

/// Core type definitions used throughout the simulator.
pub mod types;

/// The pluggable worker seam and bindings wiring.
pub mod worker;

/// In-process WebSocket pairs and coupling.
pub mod ws;

pub use bytes::Bytes;
pub use http::{Method, StatusCode, header};
pub use server::{Kumo, WebSocketUpgrade, not_found, serve, websocket_response};
