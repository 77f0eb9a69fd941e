//! HTTP front-end: the server loop that dispatches into the worker.
//!
//! The front-end accepts connections, strips test-only control headers
//! (`MF-*`), constructs a request context with gates and the subrequest
//! budget, and dispatches into the worker instance. Upgrade requests with
//! `Upgrade: websocket` perform the RFC 6455 handshake and hand the
//! upgraded socket to the WebSocket bridge when the worker returns a
//! response carrying a pair end. Uncaught worker errors are translated
//! into a status derived from the error kind plus a JSON body
//! `{name, message, stack?}`.
//!
//! # Examples
//!
//! ```rust,no_run
//! use kumo::{Kumo, serve, config::KumoOptions};
//! use tokio::net::TcpListener;
//! # use std::sync::Arc;
//! # async fn example(worker: Arc<dyn kumo::worker::WorkerInstance>) {
//! let listener = TcpListener::bind("127.0.0.1:8787").await.unwrap();
//! let kumo = Kumo::new(worker, KumoOptions::default());
//! serve(listener, kumo).await;
//! # }
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use http::{HeaderMap, StatusCode, header};
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio::net::TcpListener;
use tokio_tungstenite::{WebSocketStream, tungstenite::protocol::Role};
use tracing::{debug, error};

use crate::{
    body::KumoBody,
    clock::{SharedClock, system_clock},
    config::KumoOptions,
    error::KumoError,
    gate::RequestContext,
    responder::Responder,
    types::{BoxError, Request, Response},
    worker::WorkerInstance,
    ws::{self, WebSocket},
};

/// Response extension carrying the pair end the worker handed back for a
/// WebSocket upgrade.
#[derive(Clone)]
pub struct WebSocketUpgrade(pub WebSocket);

/// Builds the 101 response a worker returns to accept a WebSocket
/// upgrade, carrying `end` to the front-end for coupling.
pub fn websocket_response(end: WebSocket) -> Response {
    let mut res = hyper::Response::new(KumoBody::empty());
    *res.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    res.extensions_mut().insert(WebSocketUpgrade(end));
    res
}

/// The assembled simulator: a worker instance plus front-end options.
pub struct Kumo {
    worker: Arc<dyn WorkerInstance>,
    options: KumoOptions,
    clock: SharedClock,
}

impl Kumo {
    /// Creates a simulator around the given worker.
    pub fn new(worker: Arc<dyn WorkerInstance>, options: KumoOptions) -> Self {
        Self {
            worker,
            options,
            clock: system_clock(),
        }
    }

    /// Overrides the clock, mainly for tests.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// The configured options.
    pub fn options(&self) -> &KumoOptions {
        &self.options
    }

    /// Dispatches a scheduled event into the worker.
    pub async fn dispatch_scheduled(&self, cron: &str) -> crate::error::Result<()> {
        self.worker
            .scheduled(crate::worker::ScheduledController {
                scheduled_time: self.clock.now_millis(),
                cron: cron.to_string(),
            })
            .await
    }

    /// Handles one request end-to-end: header stripping, context
    /// construction, worker dispatch, error translation, and upgrade
    /// wiring.
    pub async fn handle(self: &Arc<Self>, req: Request) -> Response {
        let upgrade_key = websocket_upgrade_key(req.headers());

        let (mut parts, body) = req.into_parts();
        let on_upgrade = parts.extensions.remove::<hyper::upgrade::OnUpgrade>();
        strip_control_headers(&mut parts.headers);
        let worker_req = hyper::Request::from_parts(parts, KumoBody::new(body));

        let ctx = RequestContext::new(self.options.external_subrequest_limit);
        let mut response = match self.worker.fetch(worker_req, ctx.clone()).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Worker error: {e}");
                let e = if self.options.experimental_error_stack {
                    let stack = format!("{}: {}\n    at fetch", e.name(), e.message());
                    e.with_stack(stack)
                } else {
                    e
                };
                return e.into_http_response();
            }
        };

        // A returned pair end turns this response into a real upgrade.
        if let Some(WebSocketUpgrade(end)) = response.extensions_mut().remove::<WebSocketUpgrade>()
        {
            let (Some(accept), Some(on_upgrade)) = (upgrade_key, on_upgrade) else {
                return KumoError::type_error(
                    "Worker returned a WebSocket in a response to a non-upgrade request",
                )
                .into_http_response();
            };

            let handshake = hyper::Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(header::UPGRADE, "websocket")
                .header(header::CONNECTION, "Upgrade")
                .header("sec-websocket-accept", accept)
                .body(KumoBody::empty())
                .expect("static handshake response");

            tokio::spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        let io = TokioIo::new(upgraded);
                        let stream =
                            WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                        if let Err(e) = ws::couple(stream, end, Some(ctx)).await {
                            debug!("WebSocket bridge ended with error: {e}");
                        }
                    }
                    Err(e) => debug!("Upgrade failed: {e}"),
                }
            });
            return handshake;
        }

        response
    }
}

/// Removes reserved test-only control headers before the worker sees the
/// request.
fn strip_control_headers(headers: &mut HeaderMap) {
    let reserved: Vec<http::HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("mf-"))
        .cloned()
        .collect();
    for name in reserved {
        headers.remove(name);
    }
}

/// Computes the RFC 6455 accept key for a WebSocket upgrade request, or
/// `None` when the request is not an upgrade.
fn websocket_upgrade_key(headers: &HeaderMap) -> Option<String> {
    let is_upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !is_upgrade {
        return None;
    }
    let key = headers.get("sec-websocket-key")?;

    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    Some(STANDARD.encode(sha1.finalize()))
}

/// Starts the simulator's HTTP server on the given listener.
pub async fn serve(listener: TcpListener, kumo: Kumo) {
    if let Err(e) = run(listener, kumo).await {
        error!("Server failed: {e}");
    }
}

/// Runs the main server loop, accepting connections and dispatching
/// requests into the worker. Each connection is handled in its own task;
/// HTTP/1.1 upgrades are supported for the WebSocket bridge.
async fn run(listener: TcpListener, kumo: Kumo) -> Result<(), BoxError> {
    #[cfg(feature = "kumo-tracing")]
    crate::tracing::init_tracing();

    let kumo = Arc::new(kumo);
    tracing::info!("Kumo listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let kumo = kumo.clone();

        // Spawn a new task to handle each incoming connection.
        tokio::spawn(async move {
            let svc = service_fn(move |mut req: Request| {
                let kumo = kumo.clone();
                async move {
                    req.extensions_mut().insert(addr);
                    Ok::<_, Infallible>(kumo.handle(req).await)
                }
            });

            let mut http = http1::Builder::new();
            http.keep_alive(true);
            let conn = http.serve_connection(io, svc).with_upgrades();

            if let Err(err) = conn.await {
                debug!("Error serving connection: {err}");
            }
        });
    }
}

/// Builds the deterministic 404 the front-end serves when the worker does
/// not handle a path.
pub fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use http::HeaderValue;
    use http_body_util::BodyExt;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::{
        error::{ErrorKind, Result},
        types::WorkerRequest,
        ws::WebSocketPair,
    };

    struct EchoWorker;

    #[async_trait]
    impl WorkerInstance for EchoWorker {
        async fn fetch(&self, req: WorkerRequest, _ctx: RequestContext) -> Result<Response> {
            match req.uri().path() {
                "/headers" => {
                    let mf = req
                        .headers()
                        .keys()
                        .filter(|n| n.as_str().starts_with("mf-"))
                        .count();
                    Ok(Response::new(KumoBody::from(format!("mf-headers:{mf}"))))
                }
                "/boom" => Err(KumoError::new(
                    ErrorKind::Capacity,
                    "EntityTooLarge",
                    "too big",
                )),
                "/ws" => {
                    let (server_end, client_end) = WebSocketPair::new();
                    server_end.accept()?;
                    tokio::spawn(async move {
                        while let Ok(Some(event)) = server_end.next_event().await {
                            if let crate::ws::WsEvent::Message(msg) = event {
                                let _ = server_end.send(msg).await;
                            }
                        }
                    });
                    Ok(websocket_response(client_end))
                }
                path => Ok(Response::new(KumoBody::from(format!("echo:{path}")))),
            }
        }
    }

    async fn spawn_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let kumo = Kumo::new(Arc::new(EchoWorker), KumoOptions::default());
        tokio::spawn(async move {
            serve(listener, kumo).await;
        });
        addr
    }

    async fn http_get(addr: std::net::SocketAddr, path: &str, extra: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{extra}Connection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn dispatches_into_the_worker() {
        let addr = spawn_server().await;
        let response = http_get(addr, "/hello", "").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("echo:/hello"));
    }

    #[tokio::test]
    async fn control_headers_are_stripped() {
        let addr = spawn_server().await;
        let response = http_get(
            addr,
            "/headers",
            "MF-Original-URL: http://upstream\r\nMF-Custom-Service: x\r\n",
        )
        .await;
        assert!(response.ends_with("mf-headers:0"));
    }

    #[tokio::test]
    async fn worker_errors_become_json_bodies() {
        let addr = spawn_server().await;
        let response = http_get(addr, "/boom", "").await;
        assert!(response.starts_with("HTTP/1.1 413"));
        let body_start = response.find("\r\n\r\n").unwrap() + 4;
        let body: serde_json::Value = serde_json::from_str(&response[body_start..]).unwrap();
        assert_eq!(body["name"], "EntityTooLarge");
        assert_eq!(body["message"], "too big");
        assert!(body.get("stack").is_none());
    }

    #[tokio::test]
    async fn error_stack_header_when_enabled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let kumo = Kumo::new(
            Arc::new(EchoWorker),
            KumoOptions {
                experimental_error_stack: true,
                ..Default::default()
            },
        );
        tokio::spawn(async move {
            serve(listener, kumo).await;
        });

        let response = http_get(addr, "/boom", "").await;
        assert!(response.to_ascii_lowercase().contains("mf-experimental-error-stack: true"));
        let body_start = response.find("\r\n\r\n").unwrap() + 4;
        let body: serde_json::Value = serde_json::from_str(&response[body_start..]).unwrap();
        assert!(body["stack"].as_str().unwrap().contains("EntityTooLarge"));
    }

    #[tokio::test]
    async fn websocket_upgrade_round_trip() {
        let addr = spawn_server().await;
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut socket, response) =
            tokio_tungstenite::client_async(format!("ws://{addr}/ws"), stream)
                .await
                .unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

        socket.send(Message::Text("ping".into())).await.unwrap();
        let echoed = socket.next().await.unwrap().unwrap();
        assert_eq!(echoed, Message::Text("ping".into()));

        socket
            .send(Message::Binary(bytes::Bytes::from_static(&[1, 2, 3])))
            .await
            .unwrap();
        let echoed = socket.next().await.unwrap().unwrap();
        assert_eq!(echoed, Message::Binary(bytes::Bytes::from_static(&[1, 2, 3])));

        socket.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn accept_key_matches_rfc_6455_sample() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(
            "sec-websocket-key",
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        assert_eq!(
            websocket_upgrade_key(&headers).as_deref(),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
    }

    #[tokio::test]
    async fn body_round_trips_through_kumo_body() {
        // The wrapped request body the worker receives is readable.
        let body = KumoBody::from("payload");
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"payload");
    }
}
