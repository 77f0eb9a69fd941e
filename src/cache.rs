//! HTTP response cache gateway.
//!
//! A named (or default) cache maps a request fingerprint — method plus URL,
//! or a per-put override key — to a previously stored response. Only `GET`
//! is cacheable; other methods produce a deterministic miss. Responses
//! marked `private`, `no-store`, or `no-cache`, responses bearing
//! `Set-Cookie` (unless `Cache-Control: private=set-cookie`), responses
//! without a positive TTL, and statuses outside the cacheable set are never
//! stored.
//!
//! Matches evaluate conditionals against the stored response, `If-None-Match`
//! first (weak comparison, comma-separated lists, `*`), then
//! `If-Modified-Since`; satisfied conditionals yield 304. A `Range` header
//! yields 206 with a single `Content-Range`, a `multipart/byteranges` body
//! for several ranges, or 416 when unsatisfiable. Hits carry
//! `CF-Cache-Status: HIT`; misses return 404 with body `<miss>` so the
//! surrounding worker can distinguish them from worker-produced responses.

use std::sync::{Arc, Once};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{
    body::KumoBody,
    clock::SharedClock,
    error::Result,
    responder::Responder,
    storage::{MAX_KEY_SIZE, Storage, StoredEntry},
    types::Response,
};

/// Statuses eligible for caching.
const CACHEABLE_STATUSES: &[u16] = &[200, 203, 204, 206, 300, 301, 404, 405, 410, 414, 501];

/// Body of a deterministic miss, so workers can tell misses apart.
pub const MISS_BODY: &str = "<miss>";

/// A request as seen by the cache: method, URL, conditional headers, and an
/// optional per-put override key.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    /// Request method; only `GET` can hit.
    pub method: Method,
    /// Full request URL.
    pub url: String,
    /// Request headers; conditionals and `Range` are honored on match.
    pub headers: HeaderMap,
    /// Overrides the URL in the fingerprint when set.
    pub cache_key: Option<String>,
}

impl CacheRequest {
    /// Creates a plain `GET` request for the given URL.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            cache_key: None,
        }
    }
}

/// A response to be stored: status, headers, buffered body.
#[derive(Debug, Clone)]
pub struct CacheableResponse {
    /// Response status.
    pub status: StatusCode,
    /// Response headers, consulted for the put policy and TTL.
    pub headers: HeaderMap,
    /// Buffered response body.
    pub body: Bytes,
}

/// Stored response envelope kept in entry metadata.
#[derive(Debug, Serialize, Deserialize)]
struct CachedMeta {
    status: u16,
    headers: Vec<(String, String)>,
    stored_at_millis: u64,
}

/// HTTP response cache over the substrate.
pub struct CacheGateway {
    name: String,
    storage: Arc<dyn Storage>,
    clock: SharedClock,
    enabled: bool,
    warn_usage: bool,
    warned: Once,
}

impl CacheGateway {
    /// Creates a cache gateway. With `enabled` false every operation is a
    /// no-op and writes are silently dropped. With `warn_usage` set (the
    /// worker is configured as a non-custom subdomain) a single warning is
    /// emitted on the first put.
    pub fn new(
        name: impl Into<String>,
        storage: Arc<dyn Storage>,
        clock: SharedClock,
        enabled: bool,
        warn_usage: bool,
    ) -> Self {
        Self {
            name: name.into(),
            storage,
            clock,
            enabled,
            warn_usage,
            warned: Once::new(),
        }
    }

    /// The cache name; the shared default cache uses `"default"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self, request: &CacheRequest) -> String {
        let key = request.cache_key.as_deref().unwrap_or(&request.url);
        // Normalise parseable URLs so trivially different spellings of
        // the same resource share an entry.
        let key = match url::Url::parse(key) {
            Ok(parsed) => parsed.to_string(),
            Err(_) => key.to_string(),
        };
        let fingerprint = format!("{}:{}", request.method, key);
        if fingerprint.len() > MAX_KEY_SIZE {
            hex::encode(Sha256::digest(fingerprint.as_bytes()))
        } else {
            fingerprint
        }
    }

    /// Stores a response if the put policy allows it. Returns whether the
    /// response was stored.
    pub async fn put(&self, request: &CacheRequest, response: CacheableResponse) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        if self.warn_usage {
            self.warned.call_once(|| {
                warn!(
                    "Cache operations will have no impact if you deploy to a workers.dev subdomain"
                );
            });
        }
        if request.method != Method::GET {
            return Ok(false);
        }

        let cache_control = response
            .headers
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let directives = parse_cache_control(cache_control);
        // `private=set-cookie` is special: it licenses caching with the
        // cookie stripped, while a bare `private` rejects storage outright.
        let rejected = directives.iter().any(|(name, value)| {
            matches!(name.as_str(), "no-store" | "no-cache")
                || (name == "private" && value.as_deref() != Some("set-cookie"))
        });
        if rejected {
            return Ok(false);
        }

        let allow_set_cookie = directives
            .iter()
            .any(|(n, v)| n == "private" && v.as_deref() == Some("set-cookie"));
        if response.headers.contains_key(header::SET_COOKIE) && !allow_set_cookie {
            return Ok(false);
        }

        let Some(ttl_secs) = self.resolve_ttl(&response.headers, &directives) else {
            return Ok(false);
        };
        if !CACHEABLE_STATUSES.contains(&response.status.as_u16()) {
            return Ok(false);
        }

        let now_millis = self.clock.now_millis();
        let headers: Vec<(String, String)> = response
            .headers
            .iter()
            .filter(|(name, _)| !(allow_set_cookie && *name == header::SET_COOKIE))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let meta = CachedMeta {
            status: response.status.as_u16(),
            headers,
            stored_at_millis: now_millis,
        };

        self.storage
            .put(
                &self.fingerprint(request),
                StoredEntry {
                    value: response.body,
                    expiration: Some(now_millis / 1000 + ttl_secs),
                    metadata: Some(serde_json::to_value(&meta)?),
                },
            )
            .await?;
        Ok(true)
    }

    /// TTL resolution, first match wins: `s-maxage`, `max-age`, `Expires`,
    /// then none. The `Age` header offsets storage time accordingly.
    fn resolve_ttl(
        &self,
        headers: &HeaderMap,
        directives: &[(String, Option<String>)],
    ) -> Option<u64> {
        let age: i64 = headers
            .get(header::AGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        let raw = directive_secs(directives, "s-maxage")
            .or_else(|| directive_secs(directives, "max-age"))
            .or_else(|| {
                let expires = headers
                    .get(header::EXPIRES)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| httpdate::parse_http_date(v).ok())?;
                let expires_secs = expires
                    .duration_since(std::time::UNIX_EPOCH)
                    .ok()?
                    .as_secs() as i64;
                Some(expires_secs - self.clock.now_secs() as i64)
            })?;

        let ttl = raw - age;
        if ttl > 0 { Some(ttl as u64) } else { None }
    }

    /// Looks up the fingerprint, evaluating conditionals and ranges against
    /// the stored response. Misses return 404 with body [`MISS_BODY`].
    pub async fn match_request(&self, request: &CacheRequest) -> Result<Response> {
        if !self.enabled || request.method != Method::GET {
            return Ok(miss());
        }
        let Some(entry) = self.storage.get(&self.fingerprint(request), false).await? else {
            return Ok(miss());
        };
        let Some(meta) = entry
            .metadata
            .and_then(|m| serde_json::from_value::<CachedMeta>(m).ok())
        else {
            return Ok(miss());
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &meta.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<http::HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        headers.insert("cf-cache-status", HeaderValue::from_static("HIT"));

        // Conditionals are evaluated against the stored response, never
        // the live worker.
        if self.not_modified(&request.headers, &headers) {
            let mut res = hyper::Response::new(KumoBody::empty());
            *res.status_mut() = StatusCode::NOT_MODIFIED;
            headers.remove(header::CONTENT_LENGTH);
            *res.headers_mut() = headers;
            return Ok(res);
        }

        if let Some(range_header) = request
            .headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(specs) = parse_range_header(range_header) {
                return Ok(build_range_response(headers, &entry.value, &specs));
            }
        }

        let mut res = hyper::Response::new(KumoBody::from(entry.value.clone()));
        *res.status_mut() = StatusCode::from_u16(meta.status).unwrap_or(StatusCode::OK);
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&entry.value.len().to_string()).unwrap(),
        );
        *res.headers_mut() = headers;
        Ok(res)
    }

    fn not_modified(&self, request: &HeaderMap, stored: &HeaderMap) -> bool {
        if let Some(if_none_match) = request
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
        {
            let stored_etag = stored
                .get(header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(strip_etag);
            return if_none_match.split(',').map(str::trim).any(|candidate| {
                candidate == "*" || stored_etag.as_deref() == Some(strip_etag(candidate).as_str())
            });
        }

        if let Some(since) = request
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok())
        {
            if let Some(modified) = stored
                .get(header::LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| httpdate::parse_http_date(v).ok())
            {
                return modified <= since;
            }
        }
        false
    }

    /// Removes the entry for the fingerprint. Returns whether one existed.
    pub async fn delete(&self, request: &CacheRequest) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        self.storage.delete(&self.fingerprint(request)).await
    }
}

/// Builds the deterministic 404 miss response.
fn miss() -> Response {
    (StatusCode::NOT_FOUND, MISS_BODY).into_response()
}

fn strip_etag(raw: &str) -> String {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    raw.trim_matches('"').to_string()
}

fn parse_cache_control(value: &str) -> Vec<(String, Option<String>)> {
    value
        .split(',')
        .filter_map(|directive| {
            let directive = directive.trim();
            if directive.is_empty() {
                return None;
            }
            match directive.split_once('=') {
                Some((name, value)) => Some((
                    name.trim().to_ascii_lowercase(),
                    Some(value.trim().trim_matches('"').to_ascii_lowercase()),
                )),
                None => Some((directive.to_ascii_lowercase(), None)),
            }
        })
        .collect()
}

fn directive_secs(directives: &[(String, Option<String>)], name: &str) -> Option<i64> {
    directives
        .iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, v)| v.as_deref())
        .and_then(|v| v.parse().ok())
}

/// One parsed byte-range spec from a `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeSpec {
    /// `a-b`, both inclusive.
    Bounded(u64, u64),
    /// `a-`.
    From(u64),
    /// `-n`.
    Suffix(u64),
}

impl RangeSpec {
    /// Resolves to an inclusive `(start, end)` pair, or `None` when
    /// unsatisfiable for a body of `size` bytes.
    fn resolve(self, size: u64) -> Option<(u64, u64)> {
        match self {
            RangeSpec::Bounded(start, end) => {
                if start > end || start >= size {
                    None
                } else {
                    Some((start, end.min(size - 1)))
                }
            }
            RangeSpec::From(start) => {
                if start >= size {
                    None
                } else {
                    Some((start, size - 1))
                }
            }
            RangeSpec::Suffix(len) => {
                if len == 0 || size == 0 {
                    None
                } else {
                    Some((size.saturating_sub(len), size - 1))
                }
            }
        }
    }
}

/// Parses a `Range` header. Returns `None` for non-byte units or malformed
/// headers, in which case the range is ignored and the full body served.
fn parse_range_header(value: &str) -> Option<Vec<RangeSpec>> {
    let ranges = value.strip_prefix("bytes=")?;
    let mut specs = Vec::new();
    for part in ranges.split(',') {
        let part = part.trim();
        let (start, end) = part.split_once('-')?;
        let spec = match (start.is_empty(), end.is_empty()) {
            (true, false) => RangeSpec::Suffix(end.parse().ok()?),
            (false, true) => RangeSpec::From(start.parse().ok()?),
            (false, false) => RangeSpec::Bounded(start.parse().ok()?, end.parse().ok()?),
            (true, true) => return None,
        };
        specs.push(spec);
    }
    if specs.is_empty() { None } else { Some(specs) }
}

/// Builds the 206/416 response for the resolved range specs, recomputing
/// `Content-Length` and `Content-Range`.
fn build_range_response(mut headers: HeaderMap, body: &Bytes, specs: &[RangeSpec]) -> Response {
    let size = body.len() as u64;
    let resolved: Vec<(u64, u64)> = specs.iter().filter_map(|s| s.resolve(size)).collect();

    if resolved.is_empty() {
        let mut res = hyper::Response::new(KumoBody::empty());
        *res.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
        headers.remove(header::CONTENT_LENGTH);
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes */{size}")).unwrap(),
        );
        *res.headers_mut() = headers;
        return res;
    }

    if resolved.len() == 1 {
        let (start, end) = resolved[0];
        let slice = body.slice(start as usize..=end as usize);
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{size}")).unwrap(),
        );
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&slice.len().to_string()).unwrap(),
        );
        let mut res = hyper::Response::new(KumoBody::from(slice));
        *res.status_mut() = StatusCode::PARTIAL_CONTENT;
        *res.headers_mut() = headers;
        return res;
    }

    let boundary = uuid::Uuid::new_v4().simple().to_string();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let mut out = Vec::new();
    for (start, end) in &resolved {
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        out.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        out.extend_from_slice(format!("Content-Range: bytes {start}-{end}/{size}\r\n\r\n").as_bytes());
        out.extend_from_slice(&body[*start as usize..=*end as usize]);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{boundary}--").as_bytes());

    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&format!("multipart/byteranges; boundary={boundary}")).unwrap(),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&out.len().to_string()).unwrap(),
    );
    let mut res = hyper::Response::new(KumoBody::from(out));
    *res.status_mut() = StatusCode::PARTIAL_CONTENT;
    *res.headers_mut() = headers;
    res
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;
    use crate::{clock::Clock, clock::FakeClock, storage::MemoryStorage};

    fn setup() -> (Arc<FakeClock>, CacheGateway) {
        let clock = Arc::new(FakeClock::new(1_700_000_000_000));
        let storage = Arc::new(MemoryStorage::new(clock.clone()));
        let cache = CacheGateway::new("default", storage, clock.clone(), true, false);
        (clock, cache)
    }

    fn response(headers: &[(&str, &str)], body: &str) -> CacheableResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                name.parse::<http::HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        CacheableResponse {
            status: StatusCode::OK,
            headers: map,
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    async fn body_text(res: Response) -> String {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn hit_after_put() {
        let (_, cache) = setup();
        let req = CacheRequest::get("http://localhost/doc");
        assert!(
            cache
                .put(&req, response(&[("cache-control", "max-age=3600")], "hi"))
                .await
                .unwrap()
        );

        let res = cache.match_request(&req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get("cf-cache-status").unwrap(),
            &HeaderValue::from_static("HIT")
        );
        assert_eq!(body_text(res).await, "hi");
    }

    #[tokio::test]
    async fn miss_is_distinguishable() {
        let (_, cache) = setup();
        let res = cache
            .match_request(&CacheRequest::get("http://localhost/none"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(res).await, MISS_BODY);
    }

    #[tokio::test]
    async fn non_get_methods_never_cache() {
        let (_, cache) = setup();
        let mut req = CacheRequest::get("http://localhost/doc");
        req.method = Method::POST;
        assert!(
            !cache
                .put(&req, response(&[("cache-control", "max-age=3600")], "hi"))
                .await
                .unwrap()
        );
        let res = cache.match_request(&req).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn put_policy_rejections() {
        let (_, cache) = setup();
        let req = CacheRequest::get("http://localhost/doc");
        for headers in [
            vec![("cache-control", "private, max-age=3600")],
            vec![("cache-control", "no-store")],
            vec![("cache-control", "no-cache")],
            vec![("cache-control", "max-age=3600"), ("set-cookie", "id=1")],
            // No TTL at all.
            vec![("x-custom", "1")],
        ] {
            assert!(!cache.put(&req, response(&headers, "hi")).await.unwrap());
        }

        // Uncacheable status.
        let mut teapot = response(&[("cache-control", "max-age=3600")], "hi");
        teapot.status = StatusCode::IM_A_TEAPOT;
        assert!(!cache.put(&req, teapot).await.unwrap());
    }

    #[tokio::test]
    async fn private_set_cookie_caches_without_the_cookie() {
        let (_, cache) = setup();
        let req = CacheRequest::get("http://localhost/doc");
        assert!(
            cache
                .put(
                    &req,
                    response(
                        &[
                            ("cache-control", "max-age=3600, private=set-cookie"),
                            ("set-cookie", "id=1"),
                        ],
                        "hi",
                    ),
                )
                .await
                .unwrap()
        );
        let res = cache.match_request(&req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(!res.headers().contains_key(header::SET_COOKIE));
    }

    #[tokio::test]
    async fn ttl_resolution_order_and_age() {
        let (clock, cache) = setup();
        let req = CacheRequest::get("http://localhost/doc");
        // s-maxage wins over max-age.
        assert!(
            cache
                .put(
                    &req,
                    response(&[("cache-control", "s-maxage=2, max-age=9999")], "hi"),
                )
                .await
                .unwrap()
        );
        clock.advance(3_000);
        let res = cache.match_request(&req).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        // Age offsets the TTL.
        assert!(
            !cache
                .put(
                    &req,
                    response(&[("cache-control", "max-age=60"), ("age", "60")], "hi"),
                )
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn expires_header_used_when_no_cache_control() {
        let (clock, cache) = setup();
        let req = CacheRequest::get("http://localhost/doc");
        let expires = std::time::UNIX_EPOCH + std::time::Duration::from_secs(clock.now_secs() + 120);
        assert!(
            cache
                .put(
                    &req,
                    response(&[("expires", &httpdate::fmt_http_date(expires))], "hi"),
                )
                .await
                .unwrap()
        );
        let res = cache.match_request(&req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn if_none_match_paths() {
        let (_, cache) = setup();
        let req = CacheRequest::get("http://localhost/doc");
        cache
            .put(
                &req,
                response(
                    &[("cache-control", "max-age=3600"), ("etag", "\"x\"")],
                    "hi",
                ),
            )
            .await
            .unwrap();

        let mut matching = req.clone();
        matching
            .headers
            .insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"x\""));
        let res = cache.match_request(&matching).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(body_text(res).await, "");

        let mut listed = req.clone();
        listed.headers.insert(
            header::IF_NONE_MATCH,
            HeaderValue::from_static("\"y\", \"x\""),
        );
        let res = cache.match_request(&listed).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);

        let mut weak = req.clone();
        weak.headers
            .insert(header::IF_NONE_MATCH, HeaderValue::from_static("W/\"x\""));
        let res = cache.match_request(&weak).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);

        let mut star = req.clone();
        star.headers
            .insert(header::IF_NONE_MATCH, HeaderValue::from_static("*"));
        let res = cache.match_request(&star).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);

        let mut other = req.clone();
        other
            .headers
            .insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"y\""));
        let res = cache.match_request(&other).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_text(res).await, "hi");
    }

    #[tokio::test]
    async fn if_modified_since_compares_stored_last_modified() {
        let (clock, cache) = setup();
        let req = CacheRequest::get("http://localhost/doc");
        let modified = std::time::UNIX_EPOCH + std::time::Duration::from_secs(clock.now_secs() - 60);
        cache
            .put(
                &req,
                response(
                    &[
                        ("cache-control", "max-age=3600"),
                        ("last-modified", &httpdate::fmt_http_date(modified)),
                    ],
                    "hi",
                ),
            )
            .await
            .unwrap();

        let mut fresh = req.clone();
        fresh.headers.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_str(&httpdate::fmt_http_date(
                std::time::UNIX_EPOCH + std::time::Duration::from_secs(clock.now_secs()),
            ))
            .unwrap(),
        );
        let res = cache.match_request(&fresh).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);

        let mut stale = req.clone();
        stale.headers.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_str(&httpdate::fmt_http_date(
                std::time::UNIX_EPOCH + std::time::Duration::from_secs(clock.now_secs() - 600),
            ))
            .unwrap(),
        );
        let res = cache.match_request(&stale).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn single_byte_range() {
        let (_, cache) = setup();
        let req = CacheRequest::get("http://localhost/doc");
        cache
            .put(
                &req,
                response(&[("cache-control", "max-age=3600")], "0123456789"),
            )
            .await
            .unwrap();

        let mut ranged = req.clone();
        ranged
            .headers
            .insert(header::RANGE, HeaderValue::from_static("bytes=2-4"));
        let res = cache.match_request(&ranged).await.unwrap();
        assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            res.headers().get(header::CONTENT_RANGE).unwrap(),
            &HeaderValue::from_static("bytes 2-4/10")
        );
        assert_eq!(
            res.headers().get(header::CONTENT_LENGTH).unwrap(),
            &HeaderValue::from_static("3")
        );
        assert_eq!(body_text(res).await, "234");
    }

    #[tokio::test]
    async fn multiple_ranges_build_multipart_byteranges() {
        let (_, cache) = setup();
        let req = CacheRequest::get("http://localhost/doc");
        cache
            .put(
                &req,
                response(&[("cache-control", "max-age=3600")], "0123456789"),
            )
            .await
            .unwrap();

        let mut ranged = req.clone();
        ranged
            .headers
            .insert(header::RANGE, HeaderValue::from_static("bytes=1-3,5-6"));
        let res = cache.match_request(&ranged).await.unwrap();
        assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);
        let content_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("multipart/byteranges; boundary="));
        let body = body_text(res).await;
        assert!(body.contains("Content-Range: bytes 1-3/10"));
        assert!(body.contains("123"));
        assert!(body.contains("Content-Range: bytes 5-6/10"));
        assert!(body.contains("56"));
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_416() {
        let (_, cache) = setup();
        let req = CacheRequest::get("http://localhost/doc");
        cache
            .put(
                &req,
                response(&[("cache-control", "max-age=3600")], "0123456789"),
            )
            .await
            .unwrap();

        let mut ranged = req.clone();
        ranged
            .headers
            .insert(header::RANGE, HeaderValue::from_static("bytes=15-"));
        let res = cache.match_request(&ranged).await.unwrap();
        assert_eq!(res.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            res.headers().get(header::CONTENT_RANGE).unwrap(),
            &HeaderValue::from_static("bytes */10")
        );
    }

    #[tokio::test]
    async fn delete_removes_by_fingerprint() {
        let (_, cache) = setup();
        let req = CacheRequest::get("http://localhost/doc");
        cache
            .put(&req, response(&[("cache-control", "max-age=3600")], "hi"))
            .await
            .unwrap();
        assert!(cache.delete(&req).await.unwrap());
        assert!(!cache.delete(&req).await.unwrap());
        let res = cache.match_request(&req).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disabled_cache_is_a_no_op() {
        let clock = Arc::new(FakeClock::new(1_700_000_000_000));
        let storage = Arc::new(MemoryStorage::new(clock.clone()));
        let cache = CacheGateway::new("default", storage, clock, false, false);
        let req = CacheRequest::get("http://localhost/doc");
        assert!(
            !cache
                .put(&req, response(&[("cache-control", "max-age=3600")], "hi"))
                .await
                .unwrap()
        );
        let res = cache.match_request(&req).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(!cache.delete(&req).await.unwrap());
    }
}
