//! HTTP request and response body handling utilities.
//!
//! This module provides `KumoBody`, a flexible wrapper around HTTP body
//! implementations that supports static content, byte streams, and lazily
//! produced data. It integrates with hyper's body system while providing
//! convenience constructors for the common cases in the simulator: buffered
//! gateway responses, streamed cache bodies, and rewriter output channels.
//!
//! # Examples
//!
//! ```rust
//! use kumo::body::KumoBody;
//! use bytes::Bytes;
//! use futures_util::stream;
//!
//! // Create empty body
//! let empty = KumoBody::empty();
//!
//! // Create from bytes
//! let bytes_body = KumoBody::from(Bytes::from("Binary data"));
//!
//! // Create from stream
//! let stream_data = stream::iter(vec![
//!     Ok::<_, std::io::Error>(Bytes::from("chunk1")),
//!     Ok(Bytes::from("chunk2")),
//! ]);
//! let stream_body = KumoBody::from_stream(stream_data);
//! ```

use std::{
    fmt::Debug,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame, SizeHint};

use crate::types::{BoxBody, BoxError};

/// HTTP body wrapper with streaming and conversion support.
///
/// `KumoBody` provides a unified interface for request and response bodies
/// across the front-end, the gateways, and the HTML rewriter. It wraps
/// hyper's body system with additional convenience methods while preserving
/// streaming behavior, which the rewriter relies on to emit committed output
/// promptly.
///
/// # Examples
///
/// ```rust
/// use kumo::body::KumoBody;
///
/// let stored = KumoBody::from("cached response");
/// let nothing = KumoBody::empty();
/// ```
pub struct KumoBody(BoxBody);

impl KumoBody {
    /// Creates a new body from any type implementing the `Body` trait.
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        Self(body.map_err(|e| e.into()).boxed())
    }

    /// Creates a body from a stream of byte results.
    ///
    /// Useful for data sources that may fail mid-stream, such as positioned
    /// file reads or a rewriter pipeline whose handler raised an error. The
    /// stream error surfaces to the consumer of the body.
    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: Into<BoxError> + Debug + 'static,
    {
        let stream = stream.map_err(Into::into).map_ok(Frame::data);
        let body = StreamBody::new(stream).boxed();
        Self(body)
    }

    /// Creates an empty body with no content.
    ///
    /// Used for responses that only need status codes and headers, such as
    /// 204 No Content or 304 Not Modified.
    pub fn empty() -> Self {
        Self::new(Empty::new())
    }

    /// Buffers the remaining body into a single `Bytes`.
    ///
    /// Gateways use this when they need the full payload, for example to
    /// compute checksums on an object-store put or to store a cacheable
    /// response body.
    pub async fn collect_bytes(self) -> Result<Bytes, BoxError> {
        Ok(self.0.collect().await?.to_bytes())
    }
}

impl Default for KumoBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<()> for KumoBody {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

impl From<&str> for KumoBody {
    fn from(buf: &str) -> Self {
        let owned = buf.to_owned();
        Self::new(http_body_util::Full::from(owned))
    }
}

macro_rules! body_from_impl {
    ($ty:ty) => {
        impl From<$ty> for KumoBody {
            fn from(buf: $ty) -> Self {
                Self::new(http_body_util::Full::from(buf))
            }
        }
    };
}

body_from_impl!(String);
body_from_impl!(Vec<u8>);
body_from_impl!(Bytes);

impl Body for KumoBody {
    type Data = Bytes;
    type Error = BoxError;

    #[inline]
    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.0).poll_frame(cx)
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.0.size_hint()
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }
}
